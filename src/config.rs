use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub engine: EngineSettings,
    pub cache: CacheSettings,
    pub logging: LoggingConfig,
}

/// Embedded query engine settings
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    /// Capacity of each engine-internal LRU cache (0 = unbounded)
    pub internal_cache_capacity: usize,
    pub batch_size: usize,
    pub target_partitions: usize,
    pub query_timeout_secs: u64,
    /// Name the cache translator is registered under
    pub translator_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// Server-side template used when a cache is created on demand
    pub cache_template: Option<String>,
    pub script_cache: String,
    pub protobuf_metadata_cache: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub style: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            internal_cache_capacity: 10,
            batch_size: 8192,
            target_partitions: num_cpus::get(),
            query_timeout_secs: 30,
            translator_name: "infinispan-hotrod".to_string(),
        }
    }
}

impl EngineSettings {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_template: Some("org.infinispan.DIST_SYNC".to_string()),
            script_cache: "___script_cache".to_string(),
            protobuf_metadata_cache: "___protobuf_metadata".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            style: "auto".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Values from a .env file count as environment variables
        let _ = dotenv::dotenv();

        let engine = EngineSettings::default();
        let cache = CacheSettings::default();
        let logging = LoggingConfig::default();

        let mut builder = config::Config::builder()
            .set_default("engine.internal_cache_capacity", engine.internal_cache_capacity as u64)?
            .set_default("engine.batch_size", engine.batch_size as u64)?
            .set_default("engine.target_partitions", engine.target_partitions as u64)?
            .set_default("engine.query_timeout_secs", engine.query_timeout_secs)?
            .set_default("engine.translator_name", engine.translator_name)?
            .set_default("cache.cache_template", cache.cache_template)?
            .set_default("cache.script_cache", cache.script_cache)?
            .set_default("cache.protobuf_metadata_cache", cache.protobuf_metadata_cache)?
            .set_default("logging.level", logging.level)?
            .set_default("logging.style", logging.style)?;

        if let Ok(capacity) = env::var("INFINISPAN_SQL_CACHE_CAPACITY") {
            builder = builder.set_override(
                "engine.internal_cache_capacity",
                capacity.parse::<u64>().unwrap_or(10),
            )?;
        }

        if let Ok(batch_size) = env::var("INFINISPAN_SQL_BATCH_SIZE") {
            builder = builder.set_override("engine.batch_size", batch_size.parse::<u64>().unwrap_or(8192))?;
        }

        if let Ok(partitions) = env::var("INFINISPAN_SQL_TARGET_PARTITIONS") {
            if let Ok(partitions) = partitions.parse::<u64>() {
                builder = builder.set_override("engine.target_partitions", partitions)?;
            }
        }

        if let Ok(timeout) = env::var("INFINISPAN_SQL_QUERY_TIMEOUT") {
            builder = builder.set_override("engine.query_timeout_secs", timeout.parse::<u64>().unwrap_or(30))?;
        }

        if let Ok(template) = env::var("INFINISPAN_SQL_CACHE_TEMPLATE") {
            builder = builder.set_override("cache.cache_template", Some(template))?;
        }

        if let Ok(log_level) = env::var("RUST_LOG") {
            builder = builder.set_override("logging.level", log_level)?;
        }

        if let Ok(log_style) = env::var("RUST_LOG_STYLE") {
            builder = builder.set_override("logging.style", log_style)?;
        }

        builder.build()?.try_deserialize()
    }
}

/// Install the global fmt subscriber
///
/// Returns false when a subscriber was already installed by the host.
pub fn init_tracing(logging: &LoggingConfig) -> bool {
    use std::io::IsTerminal;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let ansi = match logging.style.as_str() {
        "never" => false,
        "always" => true,
        _ => std::io::stderr().is_terminal(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .try_init()
        .is_ok()
}
