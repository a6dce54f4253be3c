/// Database reset over a tunnel
///
/// Quiesces and recreates a Postgres database by connecting to the admin database
/// through a local tunnel port and running the reset statements one at a time.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{ConnectOptions, Connection, Executor};
use tracing::{debug, info};

use crate::core::error::{BackupError, Result};
use crate::core::tunnel::{Tunnel, TunnelState};

/// One administrative SQL connection
#[async_trait]
pub trait SqlSession: Send {
    async fn execute(&mut self, statement: &str) -> Result<()>;

    async fn database_exists(&mut self, name: &str) -> Result<bool>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens SQL sessions against a local tunnel port
#[async_trait]
pub trait SqlConnector: Send + Sync {
    async fn connect(&self, local_port: u16) -> Result<Box<dyn SqlSession>>;
}

/// Connection settings for the admin database
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    pub user: String,
    pub admin_database: String,
    pub password: Option<String>,
}

impl PostgresConnector {
    pub fn new(user: impl Into<String>, admin_database: impl Into<String>, password: Option<String>) -> Self {
        Self {
            user: user.into(),
            admin_database: admin_database.into(),
            password,
        }
    }

    fn options(&self, local_port: u16) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host("127.0.0.1")
            .port(local_port)
            .username(&self.user)
            .database(&self.admin_database)
            .ssl_mode(PgSslMode::Disable);
        match &self.password {
            Some(password) => options.password(password),
            None => options,
        }
    }
}

#[async_trait]
impl SqlConnector for PostgresConnector {
    async fn connect(&self, local_port: u16) -> Result<Box<dyn SqlSession>> {
        let conn = self
            .options(local_port)
            .connect()
            .await
            .map_err(|e| {
                BackupError::transport(
                    format!(
                        "connecting to database {} as {} on 127.0.0.1:{}",
                        self.admin_database, self.user, local_port
                    ),
                    e,
                )
            })?;
        Ok(Box::new(PostgresSession { conn }))
    }
}

struct PostgresSession {
    conn: PgConnection,
}

#[async_trait]
impl SqlSession for PostgresSession {
    async fn execute(&mut self, statement: &str) -> Result<()> {
        // &str goes over the simple query protocol, which DROP/CREATE DATABASE require
        (&mut self.conn)
            .execute(statement)
            .await
            .map_err(|e| BackupError::sql(statement, e))?;
        Ok(())
    }

    async fn database_exists(&mut self, name: &str) -> Result<bool> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(name)
            .fetch_one(&mut self.conn)
            .await
            .map_err(|e| BackupError::sql("SELECT EXISTS (SELECT 1 FROM pg_database ...)", e))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.conn
            .close()
            .await
            .map_err(|e| BackupError::transport("closing database connection", e))
    }
}

/// Quote an identifier for Postgres
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for Postgres
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// The five reset statements, in execution order
pub fn reset_statements(database: &str) -> Vec<String> {
    let ident = quote_ident(database);
    let literal = quote_literal(database);
    vec![
        format!("UPDATE pg_database SET datallowconn = false WHERE datname = {}", literal),
        format!("ALTER DATABASE {} CONNECTION LIMIT 0", ident),
        format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = {} AND pid <> pg_backend_pid()",
            literal
        ),
        format!("DROP DATABASE IF EXISTS {}", ident),
        format!("CREATE DATABASE {}", ident),
    ]
}

/// Run the reset sequence on an open session
///
/// Stops at the first failing statement. When the database does not exist yet only
/// the final CREATE runs.
pub async fn quiesce_and_recreate_with(session: &mut dyn SqlSession, database: &str) -> Result<()> {
    let statements = reset_statements(database);

    let to_run = if session.database_exists(database).await? {
        &statements[..]
    } else {
        debug!(database = %database, "Database does not exist, only creating it");
        &statements[4..]
    };

    for statement in to_run {
        debug!(statement = %statement, "Executing");
        session.execute(statement).await?;
    }
    Ok(())
}

#[derive(Clone)]
pub struct DatabaseReset {
    connector: Arc<dyn SqlConnector>,
}

impl DatabaseReset {
    pub fn new(connector: Arc<dyn SqlConnector>) -> Self {
        Self { connector }
    }

    /// Drop and recreate `database` empty through a ready tunnel
    pub async fn quiesce_and_recreate(&self, tunnel: &Tunnel, database: &str) -> Result<()> {
        if tunnel.state() != TunnelState::Ready {
            return Err(BackupError::transport(
                format!("resetting database {}", database),
                format!("tunnel to {} is {:?}, not ready", tunnel.target(), tunnel.state()),
            ));
        }

        let mut session = self.connector.connect(tunnel.local_port()).await?;
        let outcome = quiesce_and_recreate_with(session.as_mut(), database).await;
        let closed = session.close().await;
        outcome?;
        closed?;

        info!(database = %database, target = %tunnel.target(), "Database recreated empty");
        Ok(())
    }
}
