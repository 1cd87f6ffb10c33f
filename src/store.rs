use crate::{
    config::ConsistencyMode,
    model::{Buyer, CheckoutSession, Fulfillment, LineItem, PaymentData, SessionStatus, Total},
    Result, UcpError,
};
use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, Row, SqlitePool};
use std::str::FromStr;

/// Persistence for checkout sessions. One row per session, JSON columns
/// for the structured parts, mutated in place on every operation.
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
    consistency: ConsistencyMode,
}

impl SessionStore {
    pub async fn new(database_url: &str, consistency: ConsistencyMode) -> Result<Self> {
        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::from_str(database_url)?
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal),
        )
        .await?;

        let store = Self { pool, consistency };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkout_sessions (
                session_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                currency TEXT NOT NULL,
                buyer TEXT,
                line_items TEXT NOT NULL,
                totals TEXT NOT NULL,
                fulfillment TEXT,
                payment TEXT,
                platform_profile TEXT,
                order_reference TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                expires_at DATETIME NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_status ON checkout_sessions(status);
            CREATE INDEX IF NOT EXISTS idx_sessions_expires ON checkout_sessions(expires_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn insert(&self, session: &CheckoutSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO checkout_sessions (session_id, status, currency, buyer, line_items, totals, fulfillment, payment, platform_profile, order_reference, version, created_at, updated_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(session.status.as_str())
        .bind(&session.currency)
        .bind(serde_json::to_string(&session.buyer)?)
        .bind(serde_json::to_string(&session.line_items)?)
        .bind(serde_json::to_string(&session.totals)?)
        .bind(serde_json::to_string(&session.fulfillment)?)
        .bind(serde_json::to_string(&session.payment)?)
        .bind(&session.platform_profile)
        .bind(&session.order_reference)
        .bind(session.version)
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load(&self, session_id: &str) -> Result<Option<CheckoutSession>> {
        let row = sqlx::query(
            r#"
            SELECT session_id, status, currency, buyer, line_items, totals, fulfillment, payment, platform_profile, order_reference, version, created_at, updated_at, expires_at
            FROM checkout_sessions WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let status = SessionStatus::parse(&row.get::<String, _>(1))?;
                let buyer: Option<Buyer> = serde_json::from_str(&row.get::<String, _>(3))?;
                let line_items: Vec<LineItem> = serde_json::from_str(&row.get::<String, _>(4))?;
                let totals: Vec<Total> = serde_json::from_str(&row.get::<String, _>(5))?;
                let fulfillment: Option<Fulfillment> =
                    serde_json::from_str(&row.get::<String, _>(6))?;
                let payment: Option<PaymentData> = serde_json::from_str(&row.get::<String, _>(7))?;

                let session = CheckoutSession {
                    id: row.get(0),
                    status,
                    currency: row.get(2),
                    line_items,
                    buyer,
                    fulfillment,
                    totals,
                    payment,
                    platform_profile: row.get(8),
                    order_reference: row.get(9),
                    version: row.get(10),
                    created_at: row.get(11),
                    updated_at: row.get(12),
                    expires_at: row.get(13),
                };

                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// Writes the session back. Under `Optimistic` consistency the write is
    /// a compare-and-swap on the version counter; a lost race surfaces as a
    /// conflict instead of a silent overwrite.
    pub async fn update(&self, session: &mut CheckoutSession) -> Result<()> {
        let new_version = session.version + 1;

        let query = match self.consistency {
            ConsistencyMode::LastWriterWins => sqlx::query(
                r#"
                UPDATE checkout_sessions
                SET status = ?, currency = ?, buyer = ?, line_items = ?, totals = ?, fulfillment = ?, payment = ?, platform_profile = ?, order_reference = ?, version = ?, updated_at = ?, expires_at = ?
                WHERE session_id = ?
                "#,
            ),
            ConsistencyMode::Optimistic => sqlx::query(
                r#"
                UPDATE checkout_sessions
                SET status = ?, currency = ?, buyer = ?, line_items = ?, totals = ?, fulfillment = ?, payment = ?, platform_profile = ?, order_reference = ?, version = ?, updated_at = ?, expires_at = ?
                WHERE session_id = ? AND version = ?
                "#,
            ),
        };

        let query = query
            .bind(session.status.as_str())
            .bind(&session.currency)
            .bind(serde_json::to_string(&session.buyer)?)
            .bind(serde_json::to_string(&session.line_items)?)
            .bind(serde_json::to_string(&session.totals)?)
            .bind(serde_json::to_string(&session.fulfillment)?)
            .bind(serde_json::to_string(&session.payment)?)
            .bind(&session.platform_profile)
            .bind(&session.order_reference)
            .bind(new_version)
            .bind(session.updated_at)
            .bind(session.expires_at)
            .bind(&session.id);

        let query = match self.consistency {
            ConsistencyMode::LastWriterWins => query,
            ConsistencyMode::Optimistic => query.bind(session.version),
        };

        let result = query.execute(&self.pool).await?;

        if result.rows_affected() == 0 {
            return match self.consistency {
                ConsistencyMode::LastWriterWins => {
                    Err(UcpError::NotFound(format!("Checkout session '{}' not found", session.id)))
                }
                ConsistencyMode::Optimistic => Err(UcpError::StateConflict(
                    "Checkout session was modified concurrently".to_string(),
                )),
            };
        }

        session.version = new_version;
        Ok(())
    }

    pub async fn delete(&self, session_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM checkout_sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Removes expired, non-complete sessions. Idempotent; safe to run
    /// concurrently from multiple triggers.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM checkout_sessions WHERE expires_at < ? AND status != 'complete'",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TotalType;
    use chrono::Duration;
    use tempfile::NamedTempFile;

    async fn test_store(consistency: ConsistencyMode) -> (SessionStore, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let db_url = format!("sqlite://{}", temp_file.path().to_string_lossy());
        let store = SessionStore::new(&db_url, consistency).await.unwrap();
        (store, temp_file)
    }

    #[tokio::test]
    async fn test_insert_and_load_round_trip() {
        let (store, _guard) = test_store(ConsistencyMode::LastWriterWins).await;

        let mut session = CheckoutSession::new("usd", 30);
        session.totals = vec![Total { kind: TotalType::Subtotal, amount: 1999 }];
        session.platform_profile = Some("https://agent.example.com/profile".to_string());

        store.insert(&session).await.unwrap();

        let loaded = store.load(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.status, SessionStatus::Incomplete);
        assert_eq!(loaded.currency, "USD");
        assert_eq!(loaded.totals, session.totals);
        assert_eq!(loaded.platform_profile, session.platform_profile);
        assert!(store.load("chk_missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_persists_changes() {
        let (store, _guard) = test_store(ConsistencyMode::LastWriterWins).await;

        let mut session = CheckoutSession::new("USD", 30);
        store.insert(&session).await.unwrap();

        session.status = SessionStatus::Cancelled;
        session.order_reference = Some("order_1".to_string());
        store.update(&mut session).await.unwrap();
        assert_eq!(session.version, 1);

        let loaded = store.load(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Cancelled);
        assert_eq!(loaded.order_reference.as_deref(), Some("order_1"));
    }

    #[tokio::test]
    async fn test_optimistic_update_detects_conflict() {
        let (store, _guard) = test_store(ConsistencyMode::Optimistic).await;

        let session = CheckoutSession::new("USD", 30);
        store.insert(&session).await.unwrap();

        let mut first = store.load(&session.id).await.unwrap().unwrap();
        let mut second = store.load(&session.id).await.unwrap().unwrap();

        first.status = SessionStatus::ReadyForComplete;
        store.update(&mut first).await.unwrap();

        second.status = SessionStatus::Cancelled;
        let err = store.update(&mut second).await.unwrap_err();
        assert!(matches!(err, UcpError::StateConflict(_)));

        let loaded = store.load(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::ReadyForComplete);
    }

    #[tokio::test]
    async fn test_cleanup_expired_skips_complete_sessions() {
        let (store, _guard) = test_store(ConsistencyMode::LastWriterWins).await;

        let mut expired = CheckoutSession::new("USD", 30);
        expired.expires_at = Utc::now() - Duration::minutes(5);
        store.insert(&expired).await.unwrap();

        let mut complete = CheckoutSession::new("USD", 30);
        complete.status = SessionStatus::Complete;
        complete.order_reference = Some("order_1".to_string());
        complete.expires_at = Utc::now() - Duration::minutes(5);
        store.insert(&complete).await.unwrap();

        let live = CheckoutSession::new("USD", 30);
        store.insert(&live).await.unwrap();

        let removed = store.cleanup_expired().await.unwrap();
        assert_eq!(removed, 1);

        assert!(store.load(&expired.id).await.unwrap().is_none());
        assert!(store.load(&complete.id).await.unwrap().is_some());
        assert!(store.load(&live.id).await.unwrap().is_some());

        // A second run finds nothing new to remove.
        assert_eq!(store.cleanup_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete() {
        let (store, _guard) = test_store(ConsistencyMode::LastWriterWins).await;

        let session = CheckoutSession::new("USD", 30);
        store.insert(&session).await.unwrap();

        assert!(store.delete(&session.id).await.unwrap());
        assert!(!store.delete(&session.id).await.unwrap());
    }
}
