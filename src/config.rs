use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::index::{AnalyzerConfig, RecordFailurePolicy};

/// 运行时配置（TOML）
///
/// ```toml
/// index_path = "/var/lib/solitudes/index"
/// records_path = "/var/lib/solitudes/records.json"
///
/// [cache]
/// default_ttl_secs = 300
/// sweep_interval_secs = 600
///
/// [pool]
/// capacity = 20000
/// workers = 8
///
/// [analyzer]
/// tokenizer = "jieba"
/// use_hmm = true
/// mode = "search"
///
/// [rebuild]
/// on_record_failure = "abort"
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub index_path: PathBuf,
    pub records_path: PathBuf,
    pub cache: CacheConfig,
    pub pool: PoolConfig,
    pub analyzer: AnalyzerConfig,
    pub rebuild: RebuildConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_secs: u64,
    /// 0 = 不启动后台清扫
    pub sweep_interval_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub capacity: usize,
    pub workers: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebuildConfig {
    pub on_record_failure: RecordFailurePolicy,
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("solitudes")
}

impl Default for Config {
    fn default() -> Self {
        let base = data_dir();
        Self {
            index_path: base.join("index"),
            records_path: base.join("records.json"),
            cache: CacheConfig::default(),
            pool: PoolConfig::default(),
            analyzer: AnalyzerConfig::default(),
            rebuild: RebuildConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: crate::cache::DEFAULT_TTL.as_secs(),
            sweep_interval_secs: crate::cache::DEFAULT_SWEEP_INTERVAL.as_secs(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: crate::core::pool::DEFAULT_CAPACITY,
            workers: num_cpus::get(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Config {
    /// 文件不存在时返回默认配置；存在但解析失败时报错
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("Config {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("parse config {}: {}", path.display(), e))?;
        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        data_dir().join("config.toml")
    }
}
