//! Shared playhead

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct PlayheadState {
    position: f64,
    rate: f64,
}

/// Presentation position and rate shared by the player and the stream loops.
///
/// Seeks bump a generation counter watched by the stream loops so they
/// restart from the new position.
#[derive(Debug)]
pub struct Playhead {
    state: Mutex<PlayheadState>,
    seeks: watch::Sender<u64>,
}

impl Playhead {
    pub fn new(position: f64) -> Self {
        let (seeks, _) = watch::channel(0);
        Self {
            state: Mutex::new(PlayheadState { position, rate: 1.0 }),
            seeks,
        }
    }

    pub fn position(&self) -> f64 {
        self.state.lock().position
    }

    pub fn rate(&self) -> f64 {
        self.state.lock().rate
    }

    pub fn set_rate(&self, rate: f64) {
        self.state.lock().rate = rate;
    }

    /// Progress reported by the host; not a seek
    pub fn set_position(&self, position: f64) {
        self.state.lock().position = position;
    }

    /// Advance by `elapsed` wall seconds at the current rate, never past `limit`
    pub fn advance(&self, elapsed: f64, limit: f64) -> f64 {
        let mut state = self.state.lock();
        let target = state.position + elapsed * state.rate;
        if target > state.position {
            state.position = target.min(limit).max(state.position);
        }
        state.position
    }

    /// Move the playhead and restart the stream loops from there
    pub fn seek(&self, position: f64) {
        self.state.lock().position = position;
        self.seeks.send_modify(|generation| *generation += 1);
        debug!(position, generation = *self.seeks.borrow(), "Playhead seek");
    }

    pub fn seek_generation(&self) -> u64 {
        *self.seeks.borrow()
    }

    pub fn subscribe_seeks(&self) -> watch::Receiver<u64> {
        self.seeks.subscribe()
    }
}
