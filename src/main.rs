mod app;
mod config;
mod core;
mod game;

use std::sync::Arc;
use std::time::Duration;

use crate::app::{Gig, LogHost};
use crate::core::input::Autoplay;
use crate::core::sim_audio::{SimAsset, SimAudio};
use crate::game::modifiers::Modifiers;
use crate::game::setlist;

const PUMP_PERIOD: Duration = Duration::from_millis(5);

/// Headless stand-in for the audio device: one rendered asset for the demo
/// setlist, the rest is left to synthesis and generation.
fn demo_audio(synthesizer: bool) -> SimAudio {
    SimAudio::new()
        .with_asset("opening_riot.ogg", SimAsset::new(24_000.0))
        .with_synth(synthesizer)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install logger immediately, then set runtime max level from config after loading it.
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Trace)
        .try_init();
    // Startup default when config is missing or malformed.
    log::set_max_level(log::LevelFilter::Warn);

    config::load();
    let cfg = config::get();
    log::set_max_level(cfg.log_level.as_level_filter());

    let songs = if cfg.setlist_path.is_empty() {
        log::info!("No setlist configured; using the demo setlist.");
        setlist::demo_setlist()
    } else {
        setlist::load_setlist(&cfg.setlist_path)?
    };
    let modifiers = if cfg.modifiers_path.is_empty() {
        Modifiers::default()
    } else {
        Modifiers::load(&cfg.modifiers_path)?
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;
    let summary = runtime.block_on(async move {
        let audio = Arc::new(demo_audio(cfg.synthesizer));
        tokio::spawn(audio.clone().run_pump(PUMP_PERIOD));
        let mut gig = Gig::new(songs, modifiers, audio, LogHost::default(), cfg.gig_settings());
        let mut input = Autoplay::from_setting(cfg.autoplay);
        gig.run(&mut input).await
    });

    match summary {
        Some(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        None => Err("The gig could not start.".into()),
    }
}
