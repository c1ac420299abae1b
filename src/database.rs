use anyhow::Result;
use libsql::{Builder, Connection};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;

const CREATE_USERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id                 TEXT    PRIMARY KEY,
    email              TEXT    UNIQUE NOT NULL,
    full_name          TEXT,
    password_hash      TEXT    NOT NULL,
    plan_type          TEXT    NOT NULL DEFAULT 'free',
    plan_expiry_date   TEXT,
    stripe_customer_id TEXT,
    security_question  TEXT,
    security_answer    TEXT,
    created_at         INTEGER NOT NULL
);
"#;

const CREATE_CLIENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS clients (
    id         TEXT    PRIMARY KEY,
    user_id    TEXT    NOT NULL,
    name       TEXT    NOT NULL,
    email      TEXT,
    phone      TEXT,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(id)
);
"#;

const CREATE_TRANSACTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transactions (
    id          TEXT    PRIMARY KEY,
    user_id     TEXT    NOT NULL,
    client_id   TEXT,
    amount      REAL    NOT NULL,
    type        TEXT    NOT NULL,
    category    TEXT    NOT NULL DEFAULT '',
    description TEXT,
    date        TEXT    NOT NULL,
    created_at  INTEGER NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(id)
);
"#;

const CREATE_GOALS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS goals (
    id             TEXT    PRIMARY KEY,
    user_id        TEXT    NOT NULL,
    type           TEXT    NOT NULL,
    category       TEXT,
    target_amount  REAL    NOT NULL,
    current_amount REAL    NOT NULL DEFAULT 0,
    period         TEXT    NOT NULL DEFAULT 'monthly',
    description    TEXT    NOT NULL,
    created_at     INTEGER NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(id)
);
"#;

const CREATE_SECURITY_ATTEMPTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS security_attempts (
    id           TEXT    PRIMARY KEY,
    user_id      TEXT    NOT NULL,
    successful   BOOLEAN NOT NULL,
    attempt_time INTEGER NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(id)
);
"#;

const CREATE_FAKE_ANSWERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS fake_answers (
    id          TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL,
    fake_answer TEXT NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(id)
);
"#;

const CREATE_PASSWORD_RESETS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS password_resets (
    id          TEXT    PRIMARY KEY,
    user_id     TEXT    NOT NULL,
    reset_token TEXT    UNIQUE NOT NULL,
    expires_at  INTEGER NOT NULL,
    used        BOOLEAN NOT NULL DEFAULT FALSE,
    FOREIGN KEY (user_id) REFERENCES users(id)
);
"#;

const CREATE_INDEXES: [&str; 5] = [
    "CREATE INDEX IF NOT EXISTS idx_transactions_user_date ON transactions(user_id, date);",
    "CREATE INDEX IF NOT EXISTS idx_transactions_user_created ON transactions(user_id, created_at);",
    "CREATE INDEX IF NOT EXISTS idx_clients_user_created ON clients(user_id, created_at);",
    "CREATE INDEX IF NOT EXISTS idx_goals_user ON goals(user_id);",
    "CREATE INDEX IF NOT EXISTS idx_security_attempts_user ON security_attempts(user_id, attempt_time);",
];

pub type Db = Arc<RwLock<Connection>>;

/// Adds `column` to `table` when an older database file predates it.
async fn ensure_column(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<()> {
    let mut rows = conn
        .query(&format!("PRAGMA table_info({})", table), ())
        .await?;

    while let Some(row) = rows.next().await? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(());
        }
    }

    conn.execute(
        &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, definition),
        (),
    )
    .await?;
    tracing::info!(table, column, "added missing column");

    Ok(())
}

/// Opens (or creates) `saldus.db` under `data_dir` and brings the schema up to date.
pub async fn init_db(data_dir: &str) -> Result<Db> {
    tokio::fs::create_dir_all(data_dir).await?;
    let path = Path::new(data_dir).join("saldus.db");
    let db = Builder::new_local(path).build().await?;
    let conn = db.connect()?;

    conn.execute(CREATE_USERS_TABLE, ()).await?;
    conn.execute(CREATE_CLIENTS_TABLE, ()).await?;
    conn.execute(CREATE_TRANSACTIONS_TABLE, ()).await?;
    conn.execute(CREATE_GOALS_TABLE, ()).await?;
    conn.execute(CREATE_SECURITY_ATTEMPTS_TABLE, ()).await?;
    conn.execute(CREATE_FAKE_ANSWERS_TABLE, ()).await?;
    conn.execute(CREATE_PASSWORD_RESETS_TABLE, ()).await?;

    ensure_column(&conn, "users", "plan_expiry_date", "TEXT").await?;
    ensure_column(&conn, "users", "stripe_customer_id", "TEXT").await?;
    ensure_column(&conn, "transactions", "description", "TEXT").await?;

    for statement in CREATE_INDEXES {
        conn.execute(statement, ()).await?;
    }

    Ok(Arc::new(RwLock::new(conn)))
}

/// Execute a function within a database transaction, returning handler-compatible errors
///
/// The closure must return a boxed future to handle lifetime issues with async closures.
pub async fn with_transaction<F, T, E>(db: &Db, f: F) -> Result<T, E>
where
    F: for<'a> FnOnce(&'a Connection) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>,
    E: From<TransactionError>,
{
    // Exclusive access for the whole transaction
    let conn = db.write().await;

    conn.execute("BEGIN TRANSACTION", ())
        .await
        .map_err(|_| TransactionError::Begin)?;

    match f(&*conn).await {
        Ok(result) => {
            conn.execute("COMMIT", ())
                .await
                .map_err(|_| TransactionError::Commit)?;
            Ok(result)
        }
        Err(e) => {
            let _ = conn.execute("ROLLBACK", ()).await;
            Err(e)
        }
    }
}

/// Errors that can occur during transaction management
#[derive(Debug)]
pub enum TransactionError {
    Begin,
    Commit,
}
