use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use derive_more::Display;
use serde::Deserialize;

#[derive(Deserialize)]
pub struct Config {
    multicast: Option<SocketAddr>,
    room: Option<String>,
    #[serde(default)]
    cache: Cache,
    #[serde(default)]
    calibration: Calibration,
    #[serde(default)]
    sync: SyncSection,
    #[serde(default)]
    metrics: Metrics,
}

#[derive(Deserialize, Default)]
pub struct Cache {
    dir: Option<PathBuf>,
}

#[derive(Deserialize, Default)]
pub struct Calibration {
    offset_ms: Option<i64>,
    latency_comp_ms: Option<i64>,
}

#[derive(Deserialize, Default)]
pub struct SyncSection {
    profile: Option<Profile>,
}

#[derive(Deserialize, Default)]
pub struct Metrics {
    listen: Option<SocketAddr>,
}

#[derive(Deserialize, Display, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    #[display("default")]
    Default,
    #[display("ios_safe")]
    IosSafe,
}

impl std::str::FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Profile::Default),
            "ios_safe" | "ios-safe" => Ok(Profile::IosSafe),
            other => Err(format!("unknown sync profile: {other:?}")),
        }
    }
}

/// Calibration bounds. Values outside are clamped on load, loudly.
pub const CALIBRATION_OFFSET_RANGE: (i64, i64) = (-300, 300);
pub const LATENCY_COMP_RANGE: (i64, i64) = (0, 500);

pub fn clamp_calibration(offset_ms: i64, latency_comp_ms: i64) -> (i64, i64) {
    let offset = offset_ms.clamp(CALIBRATION_OFFSET_RANGE.0, CALIBRATION_OFFSET_RANGE.1);
    if offset != offset_ms {
        log::warn!("calibration offset {offset_ms}ms out of range, clamped to {offset}ms");
    }

    let latency = latency_comp_ms.clamp(LATENCY_COMP_RANGE.0, LATENCY_COMP_RANGE.1);
    if latency != latency_comp_ms {
        log::warn!("latency compensation {latency_comp_ms}ms out of range, clamped to {latency}ms");
    }

    (offset, latency)
}

/// Settings become env vars so the structopt `env = "UNISON_*"`
/// fallbacks pick them up; explicit flags still win.
pub fn load_into_env(config: &Config) {
    export("UNISON_MULTICAST", config.multicast);
    export("UNISON_ROOM", config.room.as_ref());
    export(
        "UNISON_CACHE_DIR",
        config.cache.dir.as_ref().map(|dir| dir.display().to_string()),
    );
    export("UNISON_CALIBRATION_OFFSET_MS", config.calibration.offset_ms);
    export("UNISON_LATENCY_COMP_MS", config.calibration.latency_comp_ms);
    export("UNISON_SYNC_PROFILE", config.sync.profile);
    export("UNISON_METRICS_LISTEN", config.metrics.listen);
}

fn export<T: ToString>(name: &str, value: Option<T>) {
    if let Some(value) = value {
        env::set_var(name, value.to_string());
    }
}

/// Search order: `unison.toml` in the working directory, then the XDG
/// config dirs. A file that exists but does not parse aborts the run
/// rather than being silently skipped.
pub fn read() -> Option<Config> {
    let mut candidates = vec![PathBuf::from("unison.toml")];
    if let Ok(dirs) = xdg::BaseDirectories::new() {
        candidates.extend(dirs.find_config_file("unison.toml"));
    }

    candidates.iter().find_map(|path| load(path))
}

fn load(path: &Path) -> Option<Config> {
    let contents = std::fs::read_to_string(path).ok()?;

    match toml::from_str(&contents) {
        Ok(config) => {
            log::info!("using config from {}", path.display());
            Some(config)
        }
        Err(e) => {
            log::error!("config {} is invalid: {e}", path.display());
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calibration_is_clamped_with_warnings() {
        assert_eq!(clamp_calibration(-500, 900), (-300, 500));
        assert_eq!(clamp_calibration(120, -10), (120, 0));
        assert_eq!(clamp_calibration(0, 0), (0, 0));
    }

    #[test]
    fn profile_round_trips_through_env_strings() {
        assert_eq!(Profile::IosSafe.to_string(), "ios_safe");
        assert_eq!("ios_safe".parse::<Profile>().unwrap(), Profile::IosSafe);
        assert_eq!("default".parse::<Profile>().unwrap(), Profile::Default);
    }
}
