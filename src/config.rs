use log::{LevelFilter, info, warn};
use rustc_hash::FxHashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use crate::app::GigSettings;
use crate::game::playback::LoadSettings;

const CONFIG_PATH: &str = "gigcore.ini";

/// `gigcore.ini` as read: section -> key -> raw value. Keys before the first
/// section header land in the "" section, which nothing reads.
#[derive(Debug, Default)]
pub struct SimpleIni {
    sections: FxHashMap<String, FxHashMap<String, String>>,
}

impl SimpleIni {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<(), std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        self.parse(&content);
        Ok(())
    }

    pub fn parse(&mut self, content: &str) {
        self.sections.clear();
        let mut section = String::new();

        for line in content.lines().map(str::trim) {
            if line.is_empty() || line.starts_with([';', '#']) {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = name.trim().to_string();
                self.sections.entry(section.clone()).or_default();
            } else if let Some((key, value)) = line.split_once('=')
                && !key.trim().is_empty()
            {
                self.sections
                    .entry(section.clone())
                    .or_default()
                    .insert(key.trim().to_string(), value.trim().to_string());
            }
        }
    }

    pub fn get(&self, section: &str, key: &str) -> Option<String> {
        self.sections.get(section)?.get(key).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    const fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "Off",
            Self::Error => "Error",
            Self::Warn => "Warn",
            Self::Info => "Info",
            Self::Debug => "Debug",
            Self::Trace => "Trace",
        }
    }

    pub const fn as_level_filter(&self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::Off,
            Self::Error => LevelFilter::Error,
            Self::Warn => LevelFilter::Warn,
            Self::Info => LevelFilter::Info,
            Self::Debug => LevelFilter::Debug,
            Self::Trace => LevelFilter::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(Self::Off),
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub log_level: LogLevel,
    pub frame_rate: u32,
    pub fetch_timeout_ms: u64,
    pub decode_timeout_ms: u64,
    /// Silence before note time 0, so the first notes can scroll in.
    pub lead_in_ms: f64,
    /// Delay between health reaching zero and the forced results screen.
    pub failsafe_delay_ms: u64,
    pub procedural_seed: u64,
    /// 0 = off, 1 = perfect autoplay, N >= 2 = autoplay that drops every N-th note.
    pub autoplay: u32,
    /// Whether the simulated backend offers instrument synthesis.
    pub synthesizer: bool,
    /// Empty = built-in demo setlist.
    pub setlist_path: String,
    /// Empty = default modifiers.
    pub modifiers_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            frame_rate: 60,
            fetch_timeout_ms: 8_000,
            decode_timeout_ms: 8_000,
            lead_in_ms: 2_000.0,
            failsafe_delay_ms: 3_000,
            procedural_seed: 0x5eed_ca11,
            autoplay: 1,
            synthesizer: true,
            setlist_path: String::new(),
            modifiers_path: String::new(),
        }
    }
}

impl Config {
    pub fn gig_settings(&self) -> GigSettings {
        GigSettings {
            frame_period: Duration::from_secs_f64(1.0 / f64::from(self.frame_rate.max(1))),
            failsafe_delay: Duration::from_millis(self.failsafe_delay_ms),
            load: LoadSettings {
                fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
                decode_timeout: Duration::from_millis(self.decode_timeout_ms),
                lead_in_ms: self.lead_in_ms,
                seed: self.procedural_seed,
            },
        }
    }
}

// Global, mutable configuration instance.
static CONFIG: std::sync::LazyLock<Mutex<Config>> =
    std::sync::LazyLock::new(|| Mutex::new(Config::default()));

// --- File I/O ---

fn default_config_text() -> String {
    let default = Config::default();
    let mut content = String::new();

    // [Options] section - keys in alphabetical order
    content.push_str("[Options]\n");
    content.push_str(&format!("Autoplay={}\n", default.autoplay));
    content.push_str(&format!("DecodeTimeoutMs={}\n", default.decode_timeout_ms));
    content.push_str(&format!("FailsafeDelayMs={}\n", default.failsafe_delay_ms));
    content.push_str(&format!("FetchTimeoutMs={}\n", default.fetch_timeout_ms));
    content.push_str(&format!("FrameRate={}\n", default.frame_rate));
    content.push_str(&format!("LeadInMs={}\n", default.lead_in_ms));
    content.push_str(&format!("LogLevel={}\n", default.log_level.as_str()));
    content.push_str(&format!("ProceduralSeed={}\n", default.procedural_seed));
    content.push_str(&format!("Synthesizer={}\n", u8::from(default.synthesizer)));
    content.push('\n');

    content.push_str("[Paths]\n");
    content.push_str(&format!("Modifiers={}\n", default.modifiers_path));
    content.push_str(&format!("Setlist={}\n", default.setlist_path));
    content
}

fn create_default_config_file() -> Result<(), std::io::Error> {
    info!("'{CONFIG_PATH}' not found, creating with default values.");
    std::fs::write(CONFIG_PATH, default_config_text())
}

/// Builds a config from parsed INI data, falling back to defaults key by key.
fn config_from_ini(conf: &SimpleIni) -> Config {
    let default = Config::default();
    Config {
        log_level: conf
            .get("Options", "LogLevel")
            .and_then(|v| LogLevel::from_str(&v).ok())
            .unwrap_or(default.log_level),
        frame_rate: conf
            .get("Options", "FrameRate")
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|&v| v > 0)
            .map_or(default.frame_rate, |v| v.min(1_000)),
        fetch_timeout_ms: conf
            .get("Options", "FetchTimeoutMs")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(default.fetch_timeout_ms),
        decode_timeout_ms: conf
            .get("Options", "DecodeTimeoutMs")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(default.decode_timeout_ms),
        lead_in_ms: conf
            .get("Options", "LeadInMs")
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .map_or(default.lead_in_ms, |v| v.max(0.0)),
        failsafe_delay_ms: conf
            .get("Options", "FailsafeDelayMs")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(default.failsafe_delay_ms),
        procedural_seed: conf
            .get("Options", "ProceduralSeed")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(default.procedural_seed),
        autoplay: conf
            .get("Options", "Autoplay")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(default.autoplay),
        synthesizer: conf
            .get("Options", "Synthesizer")
            .map_or(default.synthesizer, |v| {
                matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
            }),
        setlist_path: conf
            .get("Paths", "Setlist")
            .unwrap_or(default.setlist_path),
        modifiers_path: conf
            .get("Paths", "Modifiers")
            .unwrap_or(default.modifiers_path),
    }
}

pub fn load() {
    if !Path::new(CONFIG_PATH).exists()
        && let Err(e) = create_default_config_file()
    {
        warn!("Failed to create default config file: {e}");
    }

    let mut conf = SimpleIni::new();
    match conf.load(CONFIG_PATH) {
        Ok(()) => {
            let loaded = config_from_ini(&conf);
            info!(
                "Configuration loaded from '{CONFIG_PATH}' (log level {}, {} fps).",
                loaded.log_level.as_str(),
                loaded.frame_rate
            );
            *CONFIG.lock().unwrap() = loaded;
        }
        Err(e) => {
            warn!("Failed to load '{CONFIG_PATH}': {e}. Using default values.");
        }
    }
}

pub fn get() -> Config {
    CONFIG.lock().unwrap().clone()
}
