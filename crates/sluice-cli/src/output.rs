//! Output formatting for CLI

use serde::Serialize;
use sluice_core::{PlayerEvent, PlayerStats, Track};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Text,
        }
    }
}

pub fn to_json<T: Serialize>(data: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(data)?)
}

/// One line per event; JSON lines when requested
pub fn format_event(event: &PlayerEvent, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string()),
        OutputFormat::Text => match event {
            PlayerEvent::StateChanged { from, to } => format!("[state] {} -> {}", from, to),
            PlayerEvent::Adaptation { choice, .. } | PlayerEvent::VariantChanged { choice } => format!(
                "[{}] rendition {} ({} bps)",
                event.name(),
                choice.rendition_id,
                choice.bandwidth
            ),
            PlayerEvent::BufferingEnded { position, duration } => {
                format!("[buffering] resumed at {:.2}s after {:.2}s", position, duration)
            }
            PlayerEvent::GapJumped { from, to } => format!("[gap] jumped {:.2}s -> {:.2}s", from, to),
            PlayerEvent::Error {
                code,
                severity,
                message,
                ..
            } => format!("[error] {} {}: {}", severity, code, message),
            PlayerEvent::DownloadTrace(trace) => format!(
                "[download] {:?} {} bytes in {:.0}ms",
                trace.request_type, trace.bytes, trace.elapsed_ms
            ),
            other => format!("[{}]", other.name()),
        },
    }
}

pub fn print_tracks(tracks: &[Track]) {
    println!("\nTracks:");
    for track in tracks {
        let language = if track.language.is_empty() { "und" } else { &track.language };
        println!("  {} {} [{}] roles={:?}", track.id, track.kind, language, track.roles);
        for (i, r) in track.renditions().iter().enumerate() {
            let resolution = r.resolution.map(|res| res.to_string()).unwrap_or_else(|| "-".to_string());
            println!("    {}. {} - {}bps {}", i + 1, r.id, r.bandwidth, resolution);
        }
    }
}

pub fn print_stats(stats: &PlayerStats) {
    println!("\nPlayback Statistics:");
    println!("  Position: {:.2}s", stats.position);
    println!("  Buffered ahead: {:.2}s", stats.buffered_ahead);
    println!("  Estimated bandwidth: {:.0} bps", stats.estimated_bandwidth);
    if let Some(bandwidth) = stats.stream_bandwidth {
        println!("  Stream bandwidth: {} bps", bandwidth);
    }
    if let Some(resolution) = stats.resolution {
        println!("  Resolution: {}", resolution);
    }
    if let Some(latency) = stats.load_latency {
        println!("  Load latency: {:.2}s", latency);
    }
    println!("  Play time: {:.2}s", stats.play_time);
    println!("  Buffering time: {:.2}s", stats.buffering_time);
    println!("  Stalls: {}", stats.stall_count);
    println!("  Gaps jumped: {}", stats.gaps_jumped);
    println!("  Switches: {}", stats.switch_history.len());

    if !stats.drm_sessions.is_empty() {
        println!("\nDRM Sessions:");
        for session in &stats.drm_sessions {
            println!(
                "  {} {} {:?} keys={} renewals={} license={:.0}ms",
                session.session_id,
                session.key_system,
                session.state,
                session.key_statuses.len(),
                session.renewals,
                session.license_time_ms
            );
        }
    }

    let qoe = &stats.qoe;
    println!("\nQoE Score: {:.1}", qoe.score);
    println!("  Initial buffer: {:.2}s", qoe.initial_buffer_time);
    println!("  Rebuffers: {} ({:.2}s)", qoe.rebuffer_count, qoe.rebuffer_duration);
    println!("  Quality switches: {}", qoe.quality_switches);
    println!("  Average bitrate: {} bps", qoe.average_bitrate);
}
