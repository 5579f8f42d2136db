//! Database access layer with domain-specific DAOs.
//!
//! Each domain (groups, api keys, request logs, stats) has its own DAO for
//! focused operations; cross-domain transactions are composed by the caller
//! via `begin()`.

use sea_orm::{ConnectOptions, DatabaseConnection, DatabaseTransaction, DbErr, TransactionTrait};
use std::time::Duration;
use thiserror::Error;

pub mod dao;
pub mod entities;
pub mod migration;

pub use dao::{ApiKeysDao, GroupsDao, LogQuery, RequestLogsDao, StatsDao};

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Record not found")]
    NotFound,
    #[error("Constraint violation: {0}")]
    Constraint(String),
    #[error("Migration error: {0}")]
    Migration(String),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

impl From<DbErr> for DatabaseError {
    fn from(err: DbErr) -> Self {
        match err {
            DbErr::RecordNotFound(_) => DatabaseError::NotFound,
            other => DatabaseError::Database(other.to_string()),
        }
    }
}

pub(crate) fn is_unique_violation(err: &DbErr) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("unique") || msg.contains("duplicate")
}

/// Database connection manager.
pub struct DatabaseManager {
    pub connection: DatabaseConnection,
}

impl DatabaseManager {
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    pub async fn connect(url: &str) -> DatabaseResult<Self> {
        let mut options = ConnectOptions::new(url.to_string());
        // An in-memory SQLite database exists per connection; a pool of one
        // keeps every statement on the same database.
        let max_connections = if url.contains(":memory:") { 1 } else { 20 };
        options
            .max_connections(max_connections)
            .connect_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .sqlx_logging(false);

        let connection = sea_orm::Database::connect(options).await?;
        Ok(Self::new(connection))
    }

    pub async fn migrate(&self) -> DatabaseResult<()> {
        use migration::Migrator;
        use sea_orm_migration::MigratorTrait;

        tracing::info!("running database migrations");
        Migrator::up(&self.connection, None)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        tracing::info!("database migrations complete");
        Ok(())
    }

    pub async fn begin(&self) -> DatabaseResult<DatabaseTransaction> {
        Ok(self.connection.begin().await?)
    }

    pub async fn health_check(&self) -> DatabaseResult<()> {
        use entities::groups;
        use sea_orm::{EntityTrait, PaginatorTrait};

        let _ = groups::Entity::find().count(&self.connection).await?;
        Ok(())
    }

    pub fn groups(&self) -> GroupsDao {
        GroupsDao::new(self.connection.clone())
    }

    pub fn api_keys(&self) -> ApiKeysDao {
        ApiKeysDao::new(self.connection.clone())
    }

    pub fn request_logs(&self) -> RequestLogsDao {
        RequestLogsDao::new(self.connection.clone())
    }

    pub fn stats(&self) -> StatsDao {
        StatsDao::new(self.connection.clone())
    }
}
