use crate::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Shared database handle handed to implementations through
/// [`Tools::db`](crate::Tools::db).
pub type Database = PgPool;

/// Opens the single persistent PostgreSQL connection used by the process.
///
/// The pool is capped at one connection that is never reaped for idleness
/// or age, so every clone of the handle shares it. Reconnection is left to
/// the driver.
pub async fn connect(dsn: &str) -> Result<Database> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect(dsn)
        .await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[tokio::test]
    async fn malformed_dsn_is_an_error() {
        let err = connect("not a dsn").await.unwrap_err();
        assert!(matches!(err, Error::Database(_)));
        assert!(!err.is_pre_logger());
    }
}
