use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;

pub type DbPool = Pool<Sqlite>;

/// Opens (creating if missing) the database file at `path` and migrates it.
pub async fn create_db(path: &Path) -> Result<DbPool, sqlx::Error> {
    connect(&format!("sqlite:{}", path.display())).await
}

/// Private in-memory database. Lives as long as the pool.
pub async fn create_memory_db() -> Result<DbPool, sqlx::Error> {
    connect("sqlite::memory:").await
}

async fn connect(url: &str) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS institutions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS owners (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            institution_id INTEGER NOT NULL,
            number TEXT NOT NULL,
            owner_id INTEGER,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (institution_id, number),
            FOREIGN KEY (institution_id) REFERENCES institutions(id),
            FOREIGN KEY (owner_id) REFERENCES owners(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Amounts are stored as decimal text to keep them exact.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            date TEXT NOT NULL,
            amount TEXT NOT NULL,
            currency TEXT NOT NULL,
            amount_base TEXT NOT NULL,
            exchange_rate TEXT NOT NULL,
            rate_source TEXT NOT NULL,
            description TEXT NOT NULL,
            counterparty_name TEXT,
            counterparty_account TEXT,
            counterparty_bank_code TEXT,
            institution_id INTEGER NOT NULL,
            account_id INTEGER,
            owner_id INTEGER,
            transaction_type TEXT,
            tier1 TEXT,
            tier2 TEXT,
            tier3 TEXT,
            provenance TEXT NOT NULL,
            confidence INTEGER,
            is_internal_transfer INTEGER NOT NULL DEFAULT 0,
            variable_symbol TEXT,
            constant_symbol TEXT,
            specific_symbol TEXT,
            reference TEXT,
            note TEXT,
            source_file TEXT NOT NULL,
            processed_at TEXT NOT NULL,
            FOREIGN KEY (institution_id) REFERENCES institutions(id),
            FOREIGN KEY (account_id) REFERENCES accounts(id),
            FOREIGN KEY (owner_id) REFERENCES owners(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_transactions_date ON transactions(date)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS categorization_rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            conditions TEXT NOT NULL,
            tier1 TEXT NOT NULL,
            tier2 TEXT NOT NULL,
            tier3 TEXT NOT NULL,
            owner TEXT,
            origin TEXT NOT NULL DEFAULT 'learned',
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Latest manual correction per transaction; replayed into learning at startup.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS corrections (
            transaction_id TEXT PRIMARY KEY,
            tier1 TEXT NOT NULL,
            tier2 TEXT NOT NULL,
            tier3 TEXT NOT NULL,
            corrected_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (transaction_id) REFERENCES transactions(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
