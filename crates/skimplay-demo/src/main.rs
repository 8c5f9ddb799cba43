//! skimplay Demo Application
//!
//! Plays a source through headless sinks along a segment map and reports
//! what reached the sinks.
//!
//! ```bash
//! skimplay-demo [URI] [SEGMENTS_JSON] [SPEEDUP]
//! skimplay-demo "synthetic://?duration=60" segments.json 20
//! ```
//!
//! `SEGMENTS_JSON` holds a list of segments in seconds:
//!
//! ```json
//! [{"start": 20.0, "end": 30.0, "kind": "skip"},
//!  {"start": 40.0, "end": 50.0, "kind": {"speed": 1.5}}]
//! ```
//!
//! `SKIMPLAY_CONFIG` may point at a JSON `PlayerConfig`; missing fields keep
//! their defaults.

use std::error::Error;
use std::time::Duration;

use skimplay_core::sink::{PacedAudioSink, RecordingVideoSink, SinkLog};
use skimplay_core::{
    PlaybackState, Player, PlayerConfig, PlayerEvent, Segment, Sinks, SyntheticSource,
};

const DEFAULT_URI: &str = "synthetic://?duration=60";

/// Loads segments from a JSON file, or a single 10s skip at 20s.
fn load_segments(path: Option<&str>) -> Result<Vec<Segment>, Box<dyn Error>> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&text)?)
        }
        None => Ok(vec![Segment::skip(
            Duration::from_secs(20),
            Duration::from_secs(30),
        )]),
    }
}

fn load_config(speedup: f64) -> Result<PlayerConfig, Box<dyn Error>> {
    let mut config = match std::env::var("SKIMPLAY_CONFIG") {
        Ok(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        Err(_) => PlayerConfig::default(),
    };
    config.time_scale = speedup;
    config.validate()?;
    Ok(config)
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("skimplay_core=info".parse()?)
                .add_directive("skimplay_demo=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let uri = args.first().map_or(DEFAULT_URI, String::as_str);
    let segments = load_segments(args.get(1).map(String::as_str))?;
    let speedup: f64 = match args.get(2) {
        Some(value) => value.parse()?,
        None => 1.0,
    };
    let config = load_config(speedup)?;

    let log = SinkLog::new();
    let sinks = Sinks::new(
        PacedAudioSink::new(log.clone(), config.time_scale),
        RecordingVideoSink::new(log.clone()),
    );
    let player = Player::open::<SyntheticSource>(uri, sinks, config)?;
    let version = player.set_segment_map(segments)?;
    tracing::info!(
        "segment map v{} installed, logical length {:?}",
        version,
        player
            .info()
            .duration
            .map(|d| player.segment_map().logical_duration(d))
    );

    let events = player.events();
    player.play();
    for event in events.iter() {
        match event {
            PlayerEvent::StateChanged { from, to } => {
                tracing::info!("{:?} -> {:?}", from, to);
                if matches!(to, PlaybackState::Ended | PlaybackState::Stopped) {
                    break;
                }
            }
            PlayerEvent::Position(position) => {
                tracing::debug!(
                    "logical {:.2}s, source {:.2}s",
                    position.logical.as_secs_f64(),
                    position.source.as_secs_f64()
                );
            }
            PlayerEvent::SegmentMapChanged { version } => {
                tracing::info!("segment map v{}", version);
            }
            PlayerEvent::Degraded(reason) => tracing::warn!("degraded: {}", reason),
            PlayerEvent::Error(report) => {
                tracing::error!("playback failed: {}", report);
                break;
            }
        }
    }

    player.sync_metrics().log_status();
    println!("audio blocks:     {}", log.audio().len());
    println!(
        "audio logical:    {:.3}s",
        log.audio_logical_duration().as_secs_f64()
    );
    println!(
        "audio output:     {:.3}s",
        log.audio_output_duration().as_secs_f64()
    );
    println!("video presented:  {}", log.video().len());
    println!(
        "sync:             {}",
        player.sync_metrics_snapshot().quality_summary()
    );
    Ok(())
}
