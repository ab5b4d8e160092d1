use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/examgate/examgated.toml";
pub const DEFAULT_ADMIN_SEED_PATH: &str = "/etc/examgate/admin-credentials.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusType {
    System,
    Session,
}

/// Optional keys read from the TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub db_path: Option<PathBuf>,
    pub camera_device: Option<String>,
    pub camera_width: Option<u32>,
    pub camera_height: Option<u32>,
    pub warmup_frames: Option<usize>,
    pub embedder_url: Option<String>,
    pub sync_url: Option<String>,
    pub ping_url: Option<String>,
    pub ping_interval_secs: Option<u64>,
    pub match_threshold: Option<f32>,
    pub sample_interval_ms: Option<u64>,
    pub frames_per_verify: Option<usize>,
    pub enrollment_idle_secs: Option<u64>,
    pub http_timeout_secs: Option<u64>,
    pub bus: Option<BusType>,
    pub admin_seed_file: Option<PathBuf>,
}

/// Daemon configuration: defaults, then the TOML file, then `EXAMGATE_*`
/// environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Frames discarded after the camera is opened (AE/AGC settling).
    pub warmup_frames: usize,
    /// Base URL of the embedding service.
    pub embedder_url: String,
    /// Endpoint receiving the full candidate batch.
    pub sync_url: String,
    /// URL polled to decide whether the remote side is reachable.
    pub ping_url: String,
    pub ping_interval: Duration,
    /// Euclidean distance below which a live face matches.
    pub match_threshold: f32,
    /// Period of the live face-presence sampling loop.
    pub sample_interval: Duration,
    /// Frames tried per verify before reporting no face.
    pub frames_per_verify: usize,
    /// An enrollment left untouched this long is cancelled and its camera
    /// released.
    pub enrollment_idle: Duration,
    pub http_timeout: Duration,
    pub bus: BusType,
    /// JSON list of administrator accounts to seed at startup.
    pub admin_seed_file: Option<PathBuf>,
}

impl Config {
    /// Resolve configuration for the running process.
    ///
    /// The file named by `EXAMGATE_CONFIG` must exist; the default path is
    /// optional.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("EXAMGATE_CONFIG") {
            Ok(path) => Some(read_file(Path::new(&path))?),
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Some(read_file(Path::new(DEFAULT_CONFIG_PATH))?)
            }
            Err(_) => None,
        };

        let mut config = Self::from_file(file.unwrap_or_default());
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(raw: ConfigFile) -> Self {
        Self {
            db_path: raw.db_path.unwrap_or_else(default_db_path),
            camera_device: raw.camera_device.unwrap_or_else(|| "/dev/video0".to_string()),
            camera_width: raw.camera_width.unwrap_or(640),
            camera_height: raw.camera_height.unwrap_or(480),
            warmup_frames: raw.warmup_frames.unwrap_or(4),
            embedder_url: raw
                .embedder_url
                .unwrap_or_else(|| "http://127.0.0.1:8090".to_string()),
            sync_url: raw
                .sync_url
                .unwrap_or_else(|| "http://127.0.0.1:3000/api/sync-candidates".to_string()),
            ping_url: raw
                .ping_url
                .unwrap_or_else(|| "http://127.0.0.1:3000/".to_string()),
            ping_interval: Duration::from_secs(raw.ping_interval_secs.unwrap_or(15).max(1)),
            match_threshold: raw
                .match_threshold
                .unwrap_or(examgate_core::DEFAULT_MATCH_THRESHOLD),
            sample_interval: Duration::from_millis(raw.sample_interval_ms.unwrap_or(500).max(1)),
            frames_per_verify: raw.frames_per_verify.unwrap_or(3).max(1),
            enrollment_idle: Duration::from_secs(raw.enrollment_idle_secs.unwrap_or(120).max(1)),
            http_timeout: Duration::from_secs(raw.http_timeout_secs.unwrap_or(10).max(1)),
            bus: raw.bus.unwrap_or(BusType::System),
            admin_seed_file: Some(
                raw.admin_seed_file
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_ADMIN_SEED_PATH)),
            ),
        }
    }

    /// Override fields from `EXAMGATE_*` variables looked up through `var`.
    pub fn apply_env(
        &mut self,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = var("EXAMGATE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = var("EXAMGATE_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = var("EXAMGATE_CAMERA_WIDTH") {
            self.camera_width = parse("EXAMGATE_CAMERA_WIDTH", v)?;
        }
        if let Some(v) = var("EXAMGATE_CAMERA_HEIGHT") {
            self.camera_height = parse("EXAMGATE_CAMERA_HEIGHT", v)?;
        }
        if let Some(v) = var("EXAMGATE_WARMUP_FRAMES") {
            self.warmup_frames = parse("EXAMGATE_WARMUP_FRAMES", v)?;
        }
        if let Some(v) = var("EXAMGATE_EMBEDDER_URL") {
            self.embedder_url = v;
        }
        if let Some(v) = var("EXAMGATE_SYNC_URL") {
            self.sync_url = v;
        }
        if let Some(v) = var("EXAMGATE_PING_URL") {
            self.ping_url = v;
        }
        if let Some(v) = var("EXAMGATE_PING_INTERVAL_SECS") {
            let secs: u64 = parse("EXAMGATE_PING_INTERVAL_SECS", v)?;
            self.ping_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(v) = var("EXAMGATE_MATCH_THRESHOLD") {
            self.match_threshold = parse("EXAMGATE_MATCH_THRESHOLD", v)?;
        }
        if let Some(v) = var("EXAMGATE_SAMPLE_INTERVAL_MS") {
            let ms: u64 = parse("EXAMGATE_SAMPLE_INTERVAL_MS", v)?;
            self.sample_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(v) = var("EXAMGATE_FRAMES_PER_VERIFY") {
            let n: usize = parse("EXAMGATE_FRAMES_PER_VERIFY", v)?;
            self.frames_per_verify = n.max(1);
        }
        if let Some(v) = var("EXAMGATE_ENROLLMENT_IDLE_SECS") {
            let secs: u64 = parse("EXAMGATE_ENROLLMENT_IDLE_SECS", v)?;
            self.enrollment_idle = Duration::from_secs(secs.max(1));
        }
        if let Some(v) = var("EXAMGATE_HTTP_TIMEOUT_SECS") {
            let secs: u64 = parse("EXAMGATE_HTTP_TIMEOUT_SECS", v)?;
            self.http_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(v) = var("EXAMGATE_BUS") {
            self.bus = match v.as_str() {
                "system" => BusType::System,
                "session" => BusType::Session,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "EXAMGATE_BUS",
                        value: v,
                    })
                }
            };
        }
        if let Some(v) = var("EXAMGATE_ADMIN_SEED_FILE") {
            // Empty disables seeding.
            self.admin_seed_file = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let raw = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::info!(path = %path.display(), "configuration file loaded");
    Ok(raw)
}

fn parse<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value })
}

fn default_db_path() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("examgate")
        .join("examgate.db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_file(ConfigFile::default());
        assert_eq!(config.camera_device, "/dev/video0");
        assert_eq!((config.camera_width, config.camera_height), (640, 480));
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.sample_interval, Duration::from_millis(500));
        assert_eq!(config.enrollment_idle, Duration::from_secs(120));
        assert_eq!(config.bus, BusType::System);
        assert!(config.db_path.ends_with("examgate/examgate.db"));
    }

    #[test]
    fn test_toml_file_overrides_defaults() {
        let raw: ConfigFile = toml::from_str(
            r#"
            camera_device = "/dev/video2"
            match_threshold = 0.5
            bus = "session"
            sample_interval_ms = 250
            "#,
        )
        .unwrap();
        let config = Config::from_file(raw);
        assert_eq!(config.camera_device, "/dev/video2");
        assert_eq!(config.match_threshold, 0.5);
        assert_eq!(config.bus, BusType::Session);
        assert_eq!(config.sample_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_unknown_toml_key_rejected() {
        assert!(toml::from_str::<ConfigFile>("camera = \"/dev/video0\"").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let raw: ConfigFile = toml::from_str("frames_per_verify = 5").unwrap();
        let mut config = Config::from_file(raw);
        config
            .apply_env(env(&[
                ("EXAMGATE_FRAMES_PER_VERIFY", "7"),
                ("EXAMGATE_ENROLLMENT_IDLE_SECS", "30"),
                ("EXAMGATE_SYNC_URL", "https://hq.example/api/sync-candidates"),
                ("EXAMGATE_ADMIN_SEED_FILE", ""),
            ]))
            .unwrap();
        assert_eq!(config.frames_per_verify, 7);
        assert_eq!(config.enrollment_idle, Duration::from_secs(30));
        assert_eq!(config.sync_url, "https://hq.example/api/sync-candidates");
        assert!(config.admin_seed_file.is_none());
    }

    #[test]
    fn test_env_bad_value() {
        let mut config = Config::from_file(ConfigFile::default());
        let err = config
            .apply_env(env(&[("EXAMGATE_MATCH_THRESHOLD", "close")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { key: "EXAMGATE_MATCH_THRESHOLD", .. }
        ));
    }

    #[test]
    fn test_read_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("examgated.toml");
        std::fs::write(&path, "db_path = \"/var/lib/examgate/db.sqlite\"\n").unwrap();
        let raw = read_file(&path).unwrap();
        assert_eq!(raw.db_path.unwrap(), PathBuf::from("/var/lib/examgate/db.sqlite"));
        assert!(matches!(
            read_file(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
