pub mod clock;
pub mod gameplay;
pub mod life;
pub mod modifiers;
pub mod playback;
pub mod scoring;
pub mod session;
pub mod setlist;
pub mod stage_stats;
pub mod timing_windows;
