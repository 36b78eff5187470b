//! Request/response modifier chain
//!
//! Modifiers run in registration order: request modifiers before the first
//! attempt, response modifiers after a successful one. Every modifier is
//! asynchronous; synchronous closures are adapted with [`request_fn`] and
//! [`response_fn`]. The first rejection stops the chain and fails the request.

use super::request::{Request, Response};
use crate::error::BoxError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;

#[async_trait]
pub trait RequestModifier: Send + Sync {
    async fn modify_request(&self, request: &mut Request) -> std::result::Result<(), BoxError>;
}

#[async_trait]
pub trait ResponseModifier: Send + Sync {
    async fn modify_response(&self, response: &mut Response) -> std::result::Result<(), BoxError>;
}

struct FnRequestModifier<F>(F);

#[async_trait]
impl<F> RequestModifier for FnRequestModifier<F>
where
    F: Fn(&mut Request) -> std::result::Result<(), BoxError> + Send + Sync,
{
    async fn modify_request(&self, request: &mut Request) -> std::result::Result<(), BoxError> {
        (self.0)(request)
    }
}

struct FnResponseModifier<F>(F);

#[async_trait]
impl<F> ResponseModifier for FnResponseModifier<F>
where
    F: Fn(&mut Response) -> std::result::Result<(), BoxError> + Send + Sync,
{
    async fn modify_response(&self, response: &mut Response) -> std::result::Result<(), BoxError> {
        (self.0)(response)
    }
}

/// Adapt a synchronous closure into a request modifier
pub fn request_fn<F>(f: F) -> Arc<dyn RequestModifier>
where
    F: Fn(&mut Request) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
{
    Arc::new(FnRequestModifier(f))
}

/// Adapt a synchronous closure into a response modifier
pub fn response_fn<F>(f: F) -> Arc<dyn ResponseModifier>
where
    F: Fn(&mut Response) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
{
    Arc::new(FnResponseModifier(f))
}

/// Ordered modifier registry
#[derive(Default)]
pub struct ModifierChain {
    request: RwLock<Vec<Arc<dyn RequestModifier>>>,
    response: RwLock<Vec<Arc<dyn ResponseModifier>>>,
}

impl ModifierChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_request(&self, modifier: Arc<dyn RequestModifier>) {
        self.request.write().push(modifier);
    }

    pub fn register_response(&self, modifier: Arc<dyn ResponseModifier>) {
        self.response.write().push(modifier);
    }

    pub fn clear(&self) {
        self.request.write().clear();
        self.response.write().clear();
    }

    pub async fn apply_request(&self, request: &mut Request) -> std::result::Result<(), BoxError> {
        let modifiers = self.request.read().clone();
        for modifier in modifiers {
            modifier.modify_request(request).await?;
        }
        Ok(())
    }

    pub async fn apply_response(&self, response: &mut Response) -> std::result::Result<(), BoxError> {
        let modifiers = self.response.read().clone();
        for modifier in modifiers {
            modifier.modify_response(response).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttemptParameters;
    use crate::net::request::RequestType;
    use url::Url;

    fn request() -> Request {
        Request::new(
            RequestType::Segment,
            vec![Url::parse("https://cdn.example.com/seg1.m4s").unwrap()],
            AttemptParameters::default(),
        )
    }

    #[tokio::test]
    async fn test_request_modifiers_run_in_order() {
        let chain = ModifierChain::new();
        chain.register_request(request_fn(|r| {
            r.headers.insert("x-order".into(), "first".into());
            Ok(())
        }));
        chain.register_request(request_fn(|r| {
            let prev = r.headers.get("x-order").cloned().unwrap_or_default();
            r.headers.insert("x-order".into(), format!("{prev},second"));
            Ok(())
        }));

        let mut req = request();
        chain.apply_request(&mut req).await.unwrap();
        assert_eq!(req.headers.get("x-order").unwrap(), "first,second");
    }

    #[tokio::test]
    async fn test_rejection_short_circuits() {
        let chain = ModifierChain::new();
        chain.register_request(request_fn(|_| Err("denied".into())));
        chain.register_request(request_fn(|r| {
            r.headers.insert("x-reached".into(), "yes".into());
            Ok(())
        }));

        let mut req = request();
        let err = chain.apply_request(&mut req).await.unwrap_err();
        assert_eq!(err.to_string(), "denied");
        assert!(!req.headers.contains_key("x-reached"));
    }
}
