//! Persistence Layer
//!
//! SQLite storage for the message bus, the position ledger and the
//! reconciliation audit trail, with async access via sqlx.
//!
//! # Features
//! - Messages and positions survive restarts
//! - Append-only history: processed messages, position events and
//!   reconciliation reports are never updated or deleted (enforced by
//!   triggers)
//! - Idempotent schema migrations on every start
//!
//! # Database Schema
//!
//! ## Messages Table
//! - seq: Autoincrement, defines insertion order
//! - id: `{unix_millis:013}-{sequence:06}-{node:08x}`
//! - message_type, sender, recipient, priority: Header
//! - causation_id: Inbound message that produced this one
//! - idempotency_key: Unique when present
//! - body: JSON payload
//! - created_at / processed_at: processed_at is set once, by ack
//!
//! ## Positions Table
//! One row per position_id; every status change is a compare-and-set on
//! `status` that appends a row to `position_events`.
//!
//! ## Reconciliation Audit Table
//! - reconciliation_id, timestamp, status (worst severity)
//! - report_json: the full report

pub mod message_repository;
pub mod models;
pub mod position_repository;
pub mod reconciliation_audit;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

/// Database initialization error
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),
}

/// Initialize the database connection pool with default settings
///
/// # Arguments
/// - `database_url`: SQLite URL (e.g., "sqlite://data/atrium.db" or "sqlite::memory:")
///
/// # Errors
/// Returns error if database connection fails or migrations fail
pub async fn init_database(database_url: &str) -> Result<DbPool, DatabaseError> {
    let config = DatabaseConfig {
        url: database_url.to_string(),
        ..DatabaseConfig::default()
    };
    init_database_with(&config).await
}

pub async fn init_database_with(config: &DatabaseConfig) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", config.url);
    let in_memory = config.url.contains(":memory:");

    // Ensure data directory exists
    if let Some(db_path) = config.url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
                })?;
            }
        }
    }

    let mut options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    options = if config.log_queries {
        options.log_statements(tracing::log::LevelFilter::Debug)
    } else {
        options.disable_statement_logging()
    };

    // Every in-memory connection is a separate database, so the pool must
    // hold exactly one connection and never recycle it.
    let pool = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options.journal_mode(SqliteJournalMode::Wal))
            .await?
    };

    run_migrations(&pool).await?;

    info!("✓ Database initialized successfully");

    Ok(pool)
}

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "messages table",
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            message_type TEXT NOT NULL,
            sender TEXT NOT NULL,
            recipient TEXT NOT NULL,
            priority TEXT NOT NULL CHECK(priority IN ('normal', 'high')),
            causation_id TEXT,
            idempotency_key TEXT UNIQUE,
            body TEXT NOT NULL,
            created_at DATETIME NOT NULL,
            processed_at DATETIME
        )
        "#,
    ),
    (
        "positions table",
        r#"
        CREATE TABLE IF NOT EXISTS positions (
            position_id TEXT PRIMARY KEY,
            ticker TEXT NOT NULL,
            sector TEXT,
            status TEXT NOT NULL CHECK(status IN ('PENDING', 'OPEN', 'CLOSED', 'REJECTED')),
            intended_entry_price REAL NOT NULL CHECK(intended_entry_price > 0),
            intended_shares INTEGER NOT NULL CHECK(intended_shares > 0),
            intended_stop_loss REAL,
            intended_target REAL,
            actual_entry_price REAL,
            actual_shares INTEGER,
            actual_entry_date DATETIME,
            fill_kind TEXT CHECK(fill_kind IS NULL OR fill_kind IN ('FULL', 'PARTIAL')),
            exit_price REAL,
            exit_date DATETIME,
            exit_reason TEXT CHECK(exit_reason IS NULL OR exit_reason IN ('TARGET', 'STOP', 'TIME', 'MANUAL')),
            realized_pnl REAL,
            rejection_reason TEXT,
            risk_per_share REAL,
            total_risk REAL,
            order_msg_id TEXT NOT NULL UNIQUE,
            risk_msg_id TEXT,
            fill_msg_id TEXT,
            exit_msg_id TEXT,
            reject_msg_id TEXT,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL,
            CHECK(actual_shares IS NULL OR actual_shares <= intended_shares),
            CHECK(status != 'CLOSED' OR exit_reason IS NOT NULL)
        )
        "#,
    ),
    (
        "position_events table",
        r#"
        CREATE TABLE IF NOT EXISTS position_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            position_id TEXT NOT NULL REFERENCES positions(position_id),
            from_status TEXT,
            to_status TEXT NOT NULL,
            message_id TEXT,
            detail TEXT NOT NULL,
            recorded_at DATETIME NOT NULL
        )
        "#,
    ),
    (
        "reconciliation_audit table",
        r#"
        CREATE TABLE IF NOT EXISTS reconciliation_audit (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            reconciliation_id TEXT NOT NULL UNIQUE,
            reconciliation_timestamp DATETIME NOT NULL,
            status TEXT NOT NULL,
            positions_checked INTEGER NOT NULL,
            broker_checked BOOLEAN NOT NULL DEFAULT 0,
            anomaly_count INTEGER NOT NULL,
            report_json TEXT NOT NULL,
            created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    ),
    (
        "processed messages are immutable",
        r#"
        CREATE TRIGGER IF NOT EXISTS messages_immutable_after_ack
        BEFORE UPDATE ON messages
        WHEN OLD.processed_at IS NOT NULL
        BEGIN
            SELECT RAISE(ABORT, 'processed messages are immutable');
        END
        "#,
    ),
    (
        "messages are never deleted",
        r#"
        CREATE TRIGGER IF NOT EXISTS messages_no_delete
        BEFORE DELETE ON messages
        BEGIN
            SELECT RAISE(ABORT, 'messages are append-only');
        END
        "#,
    ),
    (
        "positions are never deleted",
        r#"
        CREATE TRIGGER IF NOT EXISTS positions_no_delete
        BEFORE DELETE ON positions
        BEGIN
            SELECT RAISE(ABORT, 'positions are append-only');
        END
        "#,
    ),
    (
        "terminal positions are immutable",
        r#"
        CREATE TRIGGER IF NOT EXISTS positions_terminal_immutable
        BEFORE UPDATE ON positions
        WHEN OLD.status IN ('CLOSED', 'REJECTED')
        BEGIN
            SELECT RAISE(ABORT, 'terminal positions are immutable');
        END
        "#,
    ),
    (
        "position events are immutable",
        r#"
        CREATE TRIGGER IF NOT EXISTS position_events_no_update
        BEFORE UPDATE ON position_events
        BEGIN
            SELECT RAISE(ABORT, 'position events are append-only');
        END
        "#,
    ),
    (
        "reconciliation reports are immutable",
        r#"
        CREATE TRIGGER IF NOT EXISTS reconciliation_audit_no_update
        BEFORE UPDATE ON reconciliation_audit
        BEGIN
            SELECT RAISE(ABORT, 'reconciliation reports are append-only');
        END
        "#,
    ),
    (
        "messages inbox index",
        "CREATE INDEX IF NOT EXISTS idx_messages_inbox ON messages(recipient, processed_at, seq)",
    ),
    (
        "positions status index",
        "CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status)",
    ),
    (
        "position events index",
        "CREATE INDEX IF NOT EXISTS idx_position_events_position ON position_events(position_id, id)",
    ),
    (
        "reconciliation time index",
        "CREATE INDEX IF NOT EXISTS idx_reconciliation_time ON reconciliation_audit(reconciliation_timestamp)",
    ),
    (
        "reconciliation status index",
        "CREATE INDEX IF NOT EXISTS idx_reconciliation_status ON reconciliation_audit(status)",
    ),
];

/// Run database migrations
async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    for (name, statement) in MIGRATIONS {
        sqlx::query(statement).execute(pool).await.map_err(|e| {
            DatabaseError::MigrationError(format!("Failed to create {}: {}", name, e))
        })?;
    }

    info!("✓ Database migrations completed successfully");

    Ok(())
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://data/atrium.db")
    pub url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Enable query logging
    pub log_queries: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/atrium.db".to_string(),
            max_connections: 5,
            log_queries: cfg!(debug_assertions),
        }
    }
}

impl DatabaseConfig {
    /// Load from environment variables
    pub fn from_env() -> Self {
        let url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://data/atrium.db".to_string());

        let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n: &u32| *n > 0)
            .unwrap_or(5);

        let log_queries = std::env::var("DATABASE_LOG_QUERIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(cfg!(debug_assertions));

        Self {
            url,
            max_connections,
            log_queries,
        }
    }
}
