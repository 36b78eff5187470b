//! CLI command implementations

use crate::output::{self, OutputFormat};
use crate::transport::FixtureTransport;
use anyhow::Context;
use sluice_core::{
    ClearKeyCdm, NullSink, Player, PlayerConfiguration, PlayerContext, PlayerEvent, PlayerState,
    SegmentListManifest,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Options for `play`
pub struct PlayOptions {
    pub overrides: Option<PathBuf>,
    pub start: Option<f64>,
    pub duration: u64,
    pub rendition: Option<u32>,
    pub audio_language: Option<String>,
}

fn load_config(overrides: Option<&Path>) -> anyhow::Result<PlayerConfiguration> {
    let overrides = match overrides {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading overrides from {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => serde_json::json!({}),
    };
    Ok(PlayerConfiguration::merge(overrides)?)
}

/// Print the merged configuration
pub fn config(overrides: Option<&Path>, _format: &str) -> anyhow::Result<()> {
    let config = load_config(overrides)?;
    println!("{}", output::to_json(&config)?);
    Ok(())
}

/// Play a fixture until it ends, fails or the duration limit passes
pub async fn play(fixture: &Path, options: PlayOptions, format: &str) -> anyhow::Result<()> {
    let format = OutputFormat::from(format);

    let json = tokio::fs::read_to_string(fixture)
        .await
        .with_context(|| format!("reading fixture {}", fixture.display()))?;
    let manifest = Arc::new(SegmentListManifest::from_json(&json)?);
    let config = load_config(options.overrides.as_deref())?;

    let ctx = PlayerContext::new(Arc::new(FixtureTransport::new()), Arc::new(NullSink::new()))
        .with_cdm(Arc::new(ClearKeyCdm::new()));
    let player = Player::new(ctx, config)?;

    let (listener, mut events) = player.events().subscribe_channel();
    let mut state = player.subscribe_state();

    info!(fixture = %fixture.display(), "Loading fixture");
    let session = player.load(manifest, options.start).await?;
    info!(session = %session, "Fixture loaded");

    if format == OutputFormat::Text {
        output::print_tracks(&player.tracks());
    }
    if let Some(language) = &options.audio_language {
        player.select_audio_language(language)?;
    }
    if let Some(rendition) = options.rendition {
        player.select_rendition(rendition)?;
    }

    let deadline = tokio::time::sleep(Duration::from_secs(options.duration));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                warn!(limit_secs = options.duration, "Duration limit reached");
                break;
            }
            Some(event) = events.recv() => {
                print_event(&event, format);
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                if matches!(current, PlayerState::Ended | PlayerState::Error) {
                    break;
                }
            }
        }
    }

    while let Ok(event) = events.try_recv() {
        print_event(&event, format);
    }

    let final_state = player.state();
    let stats = player.stats();
    player.events().unsubscribe(listener);
    player.release().await;

    match format {
        OutputFormat::Json => println!("{}", output::to_json(&stats)?),
        OutputFormat::Text => output::print_stats(&stats),
    }

    if final_state == PlayerState::Error {
        anyhow::bail!("playback failed");
    }
    Ok(())
}

fn print_event(event: &PlayerEvent, format: OutputFormat) {
    // Download traces are noisy; JSON consumers get everything
    if format == OutputFormat::Text && matches!(event, PlayerEvent::DownloadTrace(_)) {
        return;
    }
    println!("{}", output::format_event(event, format));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_defaults() {
        let config = load_config(None).unwrap();
        assert!(config.abr.enabled);
    }

    #[test]
    fn test_load_config_rejects_bad_overrides() {
        let path = std::env::temp_dir().join(format!("sluice-overrides-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"streaming": {"bufferingGoal": -1}}"#).unwrap();
        assert!(load_config(Some(&path)).is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
