use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};

use crate::error::{EngineResult, Error};
use crate::eval::governor::{DEFAULT_MAX_ELEMENTS, DEFAULT_MAX_SCOPES};

/// Engine-wide settings. Every field has a default, so `{}` is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Cycles allowed per `rate_window`; 0 disables rate limiting.
    #[serde(default)]
    pub rate_limit: u64,

    #[serde(default = "default_rate_window", with = "duration_ms")]
    pub rate_window: Duration,

    /// Deep-copy a host-supplied root scope instead of running in it.
    #[serde(default = "default_true")]
    pub copy_scope: bool,

    /// Deep-copy maps handed in through `Engine::set`.
    #[serde(default = "default_true")]
    pub protect_maps: bool,

    /// Live scope ceiling; 0 disables it.
    #[serde(default = "default_max_scopes")]
    pub max_scopes: usize,

    /// Element ceiling for `range`, `make` and string repetition; 0 disables it.
    #[serde(default = "default_max_elements")]
    pub max_elements: usize,

    #[serde(default = "default_true")]
    pub core_builtins: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rate_limit: 0,
            rate_window: default_rate_window(),
            copy_scope: default_true(),
            protect_maps: default_true(),
            max_scopes: default_max_scopes(),
            max_elements: default_max_elements(),
            core_builtins: default_true(),
        }
    }
}

impl EngineConfig {
    // JSONファイルから設定を読み込む
    pub fn from_file(path: &str) -> EngineResult<Self> {
        from_file(path)
    }

    pub fn with_rate_limit(mut self, limit: u64, window: Duration) -> Self {
        self.rate_limit = limit;
        self.rate_window = window;
        self
    }

    pub fn with_max_scopes(mut self, max_scopes: usize) -> Self {
        self.max_scopes = max_scopes;
        self
    }

    pub fn with_max_elements(mut self, max_elements: usize) -> Self {
        self.max_elements = max_elements;
        self
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> EngineResult<T> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)
        .map_err(|e| Error::Internal(format!("Failed to parse config file: {}", e)))?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> EngineResult<T> {
    let config = serde_json::from_str(s)
        .map_err(|e| Error::Internal(format!("Failed to parse config: {}", e)))?;
    Ok(config)
}

// デフォルト値の定義
fn default_rate_window() -> Duration {
    Duration::from_secs(1)
}
fn default_true() -> bool {
    true
}
fn default_max_scopes() -> usize {
    DEFAULT_MAX_SCOPES
}
fn default_max_elements() -> usize {
    DEFAULT_MAX_ELEMENTS
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
