//! The Postgres pool behind [`PgStore`](crate::store::PgStore).

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use repokit_core::config::DatabaseConfig;
use repokit_core::{AppError, AppResult, ErrorKind};

/// A validated, connected Postgres pool.
#[derive(Debug, Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    /// Validate `config` and open the pool.
    pub async fn connect(config: &DatabaseConfig) -> AppResult<Self> {
        let options = pool_options(config)?;
        info!(
            url = %redact_url(&config.url),
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to PostgreSQL"
        );
        let pool = options.connect(&config.url).await.map_err(|e| {
            AppError::with_source(
                ErrorKind::StoreOperation,
                format!("Failed to connect to {}", redact_url(&config.url)),
                e,
            )
        })?;
        Ok(Self { pool })
    }

    /// The sqlx pool shared by the stores built on it.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Round-trip a trivial statement to check connectivity.
    pub async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| AppError::with_source(ErrorKind::StoreOperation, "Database is not reachable", e))
    }

    /// Close every connection. Stores built on this pool fail afterwards.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }
}

fn pool_options(config: &DatabaseConfig) -> AppResult<PgPoolOptions> {
    if config.url.trim().is_empty() {
        return Err(AppError::configuration("database.url is empty"));
    }
    if config.max_connections == 0 {
        return Err(AppError::configuration("database.max_connections must be at least 1"));
    }
    if config.min_connections > config.max_connections {
        return Err(AppError::configuration(format!(
            "database.min_connections ({}) exceeds max_connections ({})",
            config.min_connections, config.max_connections
        )));
    }
    Ok(PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
        .idle_timeout(Duration::from_secs(config.idle_timeout_seconds)))
}

/// Hide the password of a connection URL, in the user info or in a
/// `password` query parameter.
pub(crate) fn redact_url(url: &str) -> String {
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, url),
    };
    let (authority, tail) = rest.split_at(rest.find(|c: char| c == '/' || c == '?').unwrap_or(rest.len()));
    let authority = match authority.rsplit_once('@') {
        Some((userinfo, host)) => match userinfo.split_once(':') {
            Some((user, _)) => format!("{user}:****@{host}"),
            None => authority.to_string(),
        },
        None => authority.to_string(),
    };
    let tail = match tail.split_once('?') {
        Some((path, query)) => {
            let params: Vec<String> = query
                .split('&')
                .map(|pair| match pair.split_once('=') {
                    Some((name, _)) if name.eq_ignore_ascii_case("password") => format!("{name}=****"),
                    _ => pair.to_string(),
                })
                .collect();
            format!("{path}?{}", params.join("&"))
        }
        None => tail.to_string(),
    };
    match scheme {
        Some(scheme) => format!("{scheme}://{authority}{tail}"),
        None => format!("{authority}{tail}"),
    }
}
