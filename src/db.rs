use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::error::{AppError, Result};

/// Database connection pool wrapper
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open a database from a DSN of the form `sqlite3:PATH`, `sqlite:PATH`
    /// or a bare path.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let path = parse_dsn(dsn)?;
        // the DSN path may carry its own query string
        let url = if path.contains('?') {
            format!("sqlite:{}&mode=rwc", path)
        } else {
            format!("sqlite:{}?mode=rwc", path)
        };

        // SQLite works best with a single writer
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    use sqlx::Executor;
                    conn.execute("PRAGMA journal_mode=WAL;").await?;
                    conn.execute("PRAGMA busy_timeout=30000;").await?;
                    conn.execute("PRAGMA synchronous=NORMAL;").await?;
                    Ok(())
                })
            })
            .connect(&url)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[cfg(test)]
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }
}

fn parse_dsn(dsn: &str) -> Result<&str> {
    let path = match dsn.split_once(':') {
        None => dsn,
        Some(("sqlite3" | "sqlite", rest)) => rest,
        Some((driver, _)) => {
            return Err(AppError::BadRequest(format!(
                "unsupported dsn driver {driver:?}, only sqlite is supported"
            )));
        }
    };
    if path.is_empty() {
        return Err(AppError::BadRequest("empty dsn".into()));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dsn_forms() {
        assert_eq!(parse_dsn("sqlite3:./assets.db").unwrap(), "./assets.db");
        assert_eq!(parse_dsn("sqlite:assets.db").unwrap(), "assets.db");
        assert_eq!(parse_dsn("assets.db").unwrap(), "assets.db");
        assert!(parse_dsn("postgres:whatever").is_err());
        assert!(parse_dsn("").is_err());
    }
}
