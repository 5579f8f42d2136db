use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub encryption: EncryptionConfig,
    pub database: DatabaseConfig,
    pub kv: KvConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub log_pipeline: LogPipelineConfig,
    pub validation: ValidationConfig,
    pub defaults: ProxyDefaults,
    /// Deployment environment. Wildcard CORS origins are refused when this
    /// is "production".
    pub environment: String,
    /// Masters run migrations, the key-pool cold load, log cleanup and the
    /// cron validator. Slaves only serve traffic.
    pub is_master: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// When set (>0), a second listener serves proxy-only routes.
    pub proxy_port: u16,
    pub read_timeout_seconds: u64,
    pub write_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub graceful_shutdown_timeout_seconds: u64,
    pub max_concurrent_requests: usize,
    /// CORS allowlist. `*` is only honoured outside production builds.
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub auth_key: String,
    pub max_failed_login_attempts: u32,
    pub lockout_duration_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    /// "memory" or "redis".
    pub backend: String,
    pub redis_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPipelineConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub retention_days: u32,
    pub cleanup_interval_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    pub interval_minutes: u64,
    pub concurrency: usize,
    pub timeout_seconds: u64,
    /// Active keys sampled per group in the silent-revocation pass. 0 disables.
    pub active_sample_size: usize,
}

/// System-wide defaults that group config overrides are merged over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyDefaults {
    pub max_retries: u32,
    pub upstream_timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub idle_conn_timeout_seconds: u64,
    pub response_header_timeout_seconds: u64,
    pub blacklist_threshold: i64,
    pub failure_counter_ttl_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3001,
                proxy_port: 0,
                read_timeout_seconds: 60,
                write_timeout_seconds: 600,
                idle_timeout_seconds: 120,
                graceful_shutdown_timeout_seconds: 30,
                max_concurrent_requests: 1024,
                allowed_origins: vec![],
            },
            auth: AuthConfig {
                auth_key: String::new(),
                max_failed_login_attempts: 5,
                lockout_duration_seconds: 900,
            },
            encryption: EncryptionConfig { key: String::new() },
            database: DatabaseConfig {
                url: "sqlite://keygate.db?mode=rwc".to_string(),
            },
            kv: KvConfig {
                backend: "memory".to_string(),
                redis_url: "redis://127.0.0.1:6379".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
            metrics: MetricsConfig {
                enabled: false,
                port: 9090,
            },
            log_pipeline: LogPipelineConfig {
                queue_capacity: 10_000,
                batch_size: 200,
                flush_interval_ms: 1000,
                retention_days: 30,
                cleanup_interval_hours: 24,
            },
            environment: "development".to_string(),
            validation: ValidationConfig {
                interval_minutes: 60,
                concurrency: 10,
                timeout_seconds: 20,
                active_sample_size: 0,
            },
            defaults: ProxyDefaults {
                max_retries: 3,
                upstream_timeout_seconds: 600,
                connect_timeout_seconds: 15,
                idle_conn_timeout_seconds: 120,
                response_header_timeout_seconds: 60,
                blacklist_threshold: 3,
                failure_counter_ttl_seconds: 3600,
            },
            is_master: true,
        }
    }
}

/// Flat environment variables recognised for compatibility with the deploy
/// contract, mapped onto their nested config paths.
const ENV_ALIASES: &[(&str, &str)] = &[
    ("AUTH_KEY", "auth.auth_key"),
    ("MAX_FAILED_LOGIN_ATTEMPTS", "auth.max_failed_login_attempts"),
    ("LOCKOUT_DURATION_SECONDS", "auth.lockout_duration_seconds"),
    ("ENCRYPTION_KEY", "encryption.key"),
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("PROXY_PORT", "server.proxy_port"),
    ("READ_TIMEOUT", "server.read_timeout_seconds"),
    ("WRITE_TIMEOUT", "server.write_timeout_seconds"),
    ("IDLE_TIMEOUT", "server.idle_timeout_seconds"),
    (
        "GRACEFUL_SHUTDOWN_TIMEOUT",
        "server.graceful_shutdown_timeout_seconds",
    ),
    ("MAX_CONCURRENT_REQUESTS", "server.max_concurrent_requests"),
    ("IS_MASTER", "is_master"),
    ("ENVIRONMENT", "environment"),
    ("DB_DSN", "database.url"),
    ("KV_ADDR", "kv.redis_url"),
    ("LOG_RETENTION_DAYS", "log_pipeline.retention_days"),
    ("LOG_BATCH_SIZE", "log_pipeline.batch_size"),
    ("LOG_FLUSH_INTERVAL_MS", "log_pipeline.flush_interval_ms"),
    ("LOG_QUEUE_CAPACITY", "log_pipeline.queue_capacity"),
];

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    pub fn load_from(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder =
            ConfigBuilder::builder().add_source(config::Config::try_from(&Config::default())?);

        match path {
            Some(p) => builder = builder.add_source(File::with_name(p)),
            None if Path::new("config.yaml").exists() => {
                builder = builder.add_source(File::with_name("config"));
            }
            None => {}
        }

        builder = builder.add_source(
            Environment::with_prefix("KEYGATE")
                .prefix_separator("_")
                .separator("__"),
        );

        for (env, key) in ENV_ALIASES {
            if let Ok(value) = std::env::var(env) {
                builder = builder.set_override(*key, value)?;
            }
        }

        // KV_ADDR doubles as the backend switch: setting it means "use redis".
        if std::env::var("KV_ADDR").is_ok() {
            builder = builder.set_override("kv.backend", "redis")?;
        }

        // ALLOWED_ORIGINS is a flat comma-separated list.
        if let Ok(raw) = std::env::var("ALLOWED_ORIGINS") {
            builder = builder.set_override("server.allowed_origins", split_origins(&raw))?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.auth_key.is_empty() {
            return Err(ConfigError::Message("AUTH_KEY is required".into()));
        }
        if self.encryption.key.is_empty() {
            return Err(ConfigError::Message("ENCRYPTION_KEY is required".into()));
        }
        if self.kv.backend != "memory" && self.kv.backend != "redis" {
            return Err(ConfigError::Message(format!(
                "unknown kv backend: {}",
                self.kv.backend
            )));
        }
        Ok(())
    }
}

/// Split the `ALLOWED_ORIGINS` environment value on commas.
fn split_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
