//! Central configuration, composed from environment variables
//! (teacher pattern: `config/mod.rs`'s `MiraConfig::from_env()`, one
//! sub-struct per concern instead of one flat bag).

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("LOREMWATCH_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://loremwatch.db".to_string()),
            max_connections: std::env::var("LOREMWATCH_DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("LOREMWATCH_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: std::env::var("LOREMWATCH_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8787),
        }
    }
}

/// Command used to spawn the per-session analyzer subprocess.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub spawn_timeout: Duration,
}

impl AnalyzerConfig {
    pub fn from_env() -> Self {
        let command =
            std::env::var("LOREMWATCH_ANALYZER_COMMAND").unwrap_or_else(|_| "analyzer".to_string());
        let args = std::env::var("LOREMWATCH_ANALYZER_ARGS")
            .map(|v| v.split_whitespace().map(|s| s.to_string()).collect())
            .unwrap_or_default();
        Self {
            command,
            args,
            spawn_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub cache_ttl: Duration,
    pub projection_cache_ttl: Duration,
    pub live_push_interval: Duration,
}

impl MetricsConfig {
    pub fn from_env() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
            projection_cache_ttl: Duration::from_secs(300),
            live_push_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    pub url: Option<String>,
    pub collection: String,
    pub connect_timeout: Duration,
}

impl VectorIndexConfig {
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("LOREMWATCH_VECTOR_URL").ok(),
            collection: std::env::var("LOREMWATCH_VECTOR_COLLECTION")
                .unwrap_or_else(|_| "observations".to_string()),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How many processed pending messages to retain globally once marked
    /// processed; older rows are pruned to keep the table from growing
    /// unbounded.
    pub keep_processed: i64,
}

impl QueueConfig {
    pub fn from_env() -> Self {
        Self {
            keep_processed: std::env::var("LOREMWATCH_QUEUE_KEEP_PROCESSED")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub analyzer: AnalyzerConfig,
    pub metrics: MetricsConfig,
    pub vector_index: VectorIndexConfig,
    pub queue: QueueConfig,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            database: DatabaseConfig::from_env(),
            server: ServerConfig::from_env(),
            analyzer: AnalyzerConfig::from_env(),
            metrics: MetricsConfig::from_env(),
            vector_index: VectorIndexConfig::from_env(),
            queue: QueueConfig::from_env(),
        }
    }
}
