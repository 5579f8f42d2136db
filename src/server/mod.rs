//! Explicit, leaf-first component wiring and the HTTP listeners.

use crate::{
    cache::KvStore,
    config::Config,
    crypto::EncryptionService,
    database::DatabaseManager,
    error::AppError,
    group::GroupManager,
    jobs::{JobScheduler, KeyValidationJob, LogCleanupJob},
    logs::RequestLogService,
    metrics,
    pool::KeyPool,
    rate_limit::RateLimiter,
    routes::{self, LoginLimiter},
    settings::SystemSettingsManager,
    shutdown::ShutdownCoordinator,
};
use axum::{Json, Router, extract::State, http::HeaderValue, middleware, routing::get};
use serde_json::json;
use std::{future::IntoFuture, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct Server {
    pub config: Arc<Config>,
    pub db: Arc<DatabaseManager>,
    pub kv: Arc<dyn KvStore>,
    pub groups: Arc<GroupManager>,
    pub pool: Arc<KeyPool>,
    pub limiter: Arc<RateLimiter>,
    pub logs: Arc<RequestLogService>,
    pub settings: Arc<SystemSettingsManager>,
    pub crypto: EncryptionService,
    pub http_client: reqwest::Client,
    pub login_limiter: Arc<LoginLimiter>,
    pub shutdown: Arc<ShutdownCoordinator>,
}

impl Server {
    /// Construct the component graph once, leaves first.
    pub async fn new(config: Config) -> Result<Self, AppError> {
        if config.metrics.enabled {
            metrics::init_metrics(config.metrics.port)
                .map_err(|e| AppError::Internal(format!("failed to start metrics: {e}")))?;
        }

        let crypto = EncryptionService::new(&config.encryption.key);
        let kv = crate::cache::connect(&config.kv).await?;
        let db = Arc::new(DatabaseManager::connect(&config.database.url).await?);
        let groups = Arc::new(GroupManager::new(db.clone()));
        let pool = Arc::new(KeyPool::new(
            kv.clone(),
            db.clone(),
            crypto.clone(),
            Duration::from_secs(config.defaults.failure_counter_ttl_seconds),
        ));
        let settings = Arc::new(SystemSettingsManager::new(
            db.clone(),
            config.defaults.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(db.clone(), settings.clone()));
        let logs = Arc::new(RequestLogService::new(db.clone(), &config.log_pipeline));

        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.defaults.connect_timeout_seconds))
            .pool_idle_timeout(Duration::from_secs(
                config.defaults.idle_conn_timeout_seconds,
            ))
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build http client: {e}")))?;

        let login_limiter = Arc::new(LoginLimiter::new(
            config.auth.max_failed_login_attempts,
            Duration::from_secs(config.auth.lockout_duration_seconds),
        ));

        let shutdown = Arc::new(ShutdownCoordinator::new(Duration::from_secs(
            config.server.graceful_shutdown_timeout_seconds,
        )));

        Ok(Self {
            config: Arc::new(config),
            db,
            kv,
            groups,
            pool,
            limiter,
            logs,
            settings,
            crypto,
            http_client,
            login_limiter,
            shutdown,
        })
    }

    pub async fn run(&self) -> Result<(), AppError> {
        if self.config.is_master {
            self.db.migrate().await?;
            self.pool.load_from_db().await?;
        }
        self.settings.reload().await?;
        self.groups.initialize().await?;

        // Every node serving proxy traffic runs its own log consumer; the
        // additive DB upserts keep concurrent consumers correct.
        let log_consumer = self.logs.clone().start(self.shutdown.subscribe());

        let scheduler = if self.config.is_master {
            let mut scheduler = JobScheduler::new(self.shutdown.subscribe());
            scheduler.schedule(
                Arc::new(LogCleanupJob::new(
                    self.db.clone(),
                    self.config.log_pipeline.retention_days,
                )),
                Duration::from_secs(self.config.log_pipeline.cleanup_interval_hours.max(1) * 3600),
            );
            scheduler.schedule(
                Arc::new(KeyValidationJob::new(
                    self.db.clone(),
                    self.pool.clone(),
                    self.groups.clone(),
                    self.crypto.clone(),
                    self.http_client.clone(),
                    self.config.validation.clone(),
                    self.settings.clone(),
                )),
                Duration::from_secs(self.config.validation.interval_minutes.max(1) * 60),
            );
            Some(scheduler)
        } else {
            None
        };

        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .map_err(|e| AppError::Internal(format!("invalid listen address: {e}")))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| AppError::Internal(format!("failed to bind {addr}: {e}")))?;
        info!("listening on http://{addr}");

        let proxy_listener = if self.config.server.proxy_port > 0 {
            let addr: SocketAddr = format!(
                "{}:{}",
                self.config.server.host, self.config.server.proxy_port
            )
            .parse()
            .map_err(|e| AppError::Internal(format!("invalid proxy address: {e}")))?;
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| AppError::Internal(format!("failed to bind {addr}: {e}")))?;
            info!("proxy-only listener on http://{addr}");
            Some(listener)
        } else {
            None
        };

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            shutdown.wait_for_shutdown_signal().await;
        });

        let serve_main = {
            let mut rx = self.shutdown.subscribe();
            axum::serve(
                listener,
                self.create_app()
                    .into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = rx.changed().await;
            })
        };

        let result = match proxy_listener {
            Some(proxy_listener) => {
                let serve_proxy = {
                    let mut rx = self.shutdown.subscribe();
                    axum::serve(
                        proxy_listener,
                        self.create_proxy_app()
                            .into_make_service_with_connect_info::<SocketAddr>(),
                    )
                    .with_graceful_shutdown(async move {
                        let _ = rx.changed().await;
                    })
                };
                tokio::try_join!(serve_main.into_future(), serve_proxy.into_future()).map(|_| ())
            }
            None => serve_main.await,
        };
        if let Err(e) = result {
            error!("server error: {e}");
        }

        // In-flight requests have drained (or the listener gave up); the
        // coordinator sequences the background services within its budget.
        self.shutdown
            .drain(scheduler, log_consumer, &self.groups)
            .await;
        Ok(())
    }

    /// Full router: proxy routes, admin API, health.
    pub fn create_app(&self) -> Router {
        let admin = routes::public_admin_routes().merge(
            routes::protected_admin_routes().layer(middleware::from_fn_with_state(
                self.clone(),
                routes::admin_auth,
            )),
        );

        let mut app = Router::new()
            .merge(crate::proxy::router())
            .nest("/api", admin)
            .route("/health", get(health))
            .with_state(self.clone());

        if let Some(cors) = self.cors_layer() {
            app = app.layer(cors);
        }
        app.layer(GlobalConcurrencyLimitLayer::new(
            self.config.server.max_concurrent_requests.max(1),
        ))
    }

    /// Stripped router for the dedicated proxy port.
    pub fn create_proxy_app(&self) -> Router {
        Router::new()
            .merge(crate::proxy::router())
            .route("/health", get(health))
            .with_state(self.clone())
            .layer(GlobalConcurrencyLimitLayer::new(
                self.config.server.max_concurrent_requests.max(1),
            ))
    }

    fn cors_layer(&self) -> Option<CorsLayer> {
        let origins = &self.config.server.allowed_origins;
        if origins.is_empty() {
            return None;
        }
        if origins.iter().any(|o| o == "*") {
            // Wildcard is a development convenience only; in production it
            // is dropped and any explicit origins still apply.
            if self.config.is_production() {
                warn!("CORS wildcard origin refused in production");
            } else {
                return Some(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                );
            }
        }
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter(|o| o.as_str() != "*")
            .filter_map(|o| o.parse::<HeaderValue>().ok())
            .collect();
        if parsed.is_empty() {
            return None;
        }
        Some(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(parsed))
                .allow_methods(Any)
                .allow_headers(Any),
        )
    }
}

async fn health(State(server): State<Server>) -> Json<serde_json::Value> {
    let db_ok = server.db.health_check().await.is_ok();
    let kv_ok = server.kv.ping().await.is_ok();
    Json(json!({
        "status": if db_ok && kv_ok { "ok" } else { "degraded" },
        "database": db_ok,
        "kv": kv_ok,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn server_with_origins(origins: Vec<&str>, environment: &str) -> Server {
        let mut config = Config::default();
        config.auth.auth_key = "admin".into();
        config.encryption.key = "secret".into();
        config.database.url = "sqlite::memory:".into();
        config.server.allowed_origins = origins.into_iter().map(str::to_string).collect();
        config.environment = environment.to_string();
        Server::new(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_cors_wildcard_allowed_in_development() {
        let server = server_with_origins(vec!["*"], "development").await;
        assert!(server.cors_layer().is_some());
    }

    #[tokio::test]
    async fn test_cors_wildcard_refused_in_production() {
        let server = server_with_origins(vec!["*"], "production").await;
        assert!(server.cors_layer().is_none());

        // Explicit origins still apply alongside a refused wildcard.
        let server =
            server_with_origins(vec!["*", "https://admin.example"], "production").await;
        assert!(server.cors_layer().is_some());
    }

    #[tokio::test]
    async fn test_cors_disabled_without_origins() {
        let server = server_with_origins(vec![], "production").await;
        assert!(server.cors_layer().is_none());
    }
}
