pub mod audio;
pub mod input;
pub mod sim_audio;
