//! SQLite ledger
//!
//! Every write is a single `INSERT .. ON CONFLICT .. DO UPDATE` (or an
//! `UPDATE`) so two deliveries racing on the same provider id converge
//! inside the database. Scalars use `COALESCE(incoming, stored)`; metadata
//! is merged shallowly by removing the incoming keys from the stored
//! object and patching the incoming object on top.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};

use super::{
    clamp_limit, new_id, CheckoutLedger, CheckoutSession, CheckoutSessionUpsert, Order,
    OrderMetadataUpdate, OrderUpsert, SessionStatus, SessionStatusUpdate, WebhookLogEntry,
    WebhookLogStore, WebhookLogUpdate,
};
use crate::error::{PaymentError, Result};
use crate::metadata::MetadataBag;

const SESSION_COLUMNS: &str = "id, stripe_session_id, stripe_payment_intent_id, \
     stripe_subscription_id, offer_id, lander_id, customer_email, metadata, status, source, \
     created_at, updated_at";

const ORDER_COLUMNS: &str = "id, checkout_session_id, stripe_session_id, \
     stripe_payment_intent_id, stripe_charge_id, amount_total, currency, offer_id, lander_id, \
     customer_email, customer_name, metadata, payment_status, payment_method, source, \
     created_at, updated_at";

const WEBHOOK_COLUMNS: &str =
    "event_id, event_type, payment_intent_id, status, attempts, last_error, metadata, created_at, updated_at";

const ORDER_MERGE_SET: &str = "checkout_session_id = COALESCE(excluded.checkout_session_id, orders.checkout_session_id), \
     stripe_session_id = COALESCE(excluded.stripe_session_id, orders.stripe_session_id), \
     stripe_charge_id = COALESCE(excluded.stripe_charge_id, orders.stripe_charge_id), \
     amount_total = COALESCE(excluded.amount_total, orders.amount_total), \
     currency = COALESCE(excluded.currency, orders.currency), \
     offer_id = COALESCE(excluded.offer_id, orders.offer_id), \
     lander_id = COALESCE(excluded.lander_id, orders.lander_id), \
     customer_email = COALESCE(excluded.customer_email, orders.customer_email), \
     customer_name = COALESCE(excluded.customer_name, orders.customer_name), \
     payment_status = COALESCE(excluded.payment_status, orders.payment_status), \
     payment_method = COALESCE(excluded.payment_method, orders.payment_method), \
     source = excluded.source, \
     updated_at = excluded.updated_at";

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    stripe_session_id: String,
    stripe_payment_intent_id: Option<String>,
    stripe_subscription_id: Option<String>,
    offer_id: Option<String>,
    lander_id: Option<String>,
    customer_email: Option<String>,
    metadata: String,
    status: String,
    source: String,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<SessionRow> for CheckoutSession {
    type Error = PaymentError;

    fn try_from(row: SessionRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            stripe_session_id: row.stripe_session_id,
            stripe_payment_intent_id: row.stripe_payment_intent_id,
            stripe_subscription_id: row.stripe_subscription_id,
            offer_id: row.offer_id,
            lander_id: row.lander_id,
            customer_email: row.customer_email,
            metadata: MetadataBag::from_json_str(&row.metadata),
            status: row.status.parse()?,
            source: row.source.parse()?,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: String,
    checkout_session_id: Option<String>,
    stripe_session_id: Option<String>,
    stripe_payment_intent_id: Option<String>,
    stripe_charge_id: Option<String>,
    amount_total: Option<i64>,
    currency: Option<String>,
    offer_id: Option<String>,
    lander_id: Option<String>,
    customer_email: Option<String>,
    customer_name: Option<String>,
    metadata: String,
    payment_status: Option<String>,
    payment_method: Option<String>,
    source: String,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<OrderRow> for Order {
    type Error = PaymentError;

    fn try_from(row: OrderRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            checkout_session_id: row.checkout_session_id,
            stripe_session_id: row.stripe_session_id,
            stripe_payment_intent_id: row.stripe_payment_intent_id,
            stripe_charge_id: row.stripe_charge_id,
            amount_total: row.amount_total,
            currency: row.currency,
            offer_id: row.offer_id,
            lander_id: row.lander_id,
            customer_email: row.customer_email,
            customer_name: row.customer_name,
            metadata: MetadataBag::from_json_str(&row.metadata),
            payment_status: row.payment_status,
            payment_method: row.payment_method,
            source: row.source.parse()?,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct WebhookRow {
    event_id: String,
    event_type: String,
    payment_intent_id: Option<String>,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    metadata: String,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<WebhookRow> for WebhookLogEntry {
    type Error = PaymentError;

    fn try_from(row: WebhookRow) -> Result<Self> {
        Ok(Self {
            event_id: row.event_id,
            event_type: row.event_type,
            payment_intent_id: row.payment_intent_id,
            status: row.status.parse()?,
            attempts: row.attempts,
            last_error: row.last_error,
            metadata: MetadataBag::from_json_str(&row.metadata),
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        })
    }
}

fn from_millis(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts).unwrap_or_default()
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// JSON paths of the incoming keys, e.g. `$."licenseKey"`.
fn metadata_paths(incoming: &MetadataBag) -> Vec<String> {
    incoming
        .keys()
        .map(|key| format!("$.\"{}\"", key.replace('"', "\\\"")))
        .collect()
}

/// SQL expression merging `incoming` (bound as `patch`) into `stored`.
///
/// Binds: one path per incoming key, in key order, before `patch`.
fn metadata_merge_expr(stored: &str, patch: &str, key_count: usize) -> String {
    if key_count == 0 {
        return stored.to_string();
    }
    let paths = vec!["?"; key_count].join(", ");
    format!("json_patch(json_remove({stored}, {paths}), {patch})")
}

/// SQLite-backed ledger
#[derive(Clone)]
pub struct SqliteLedger {
    pool: Pool<Sqlite>,
}

impl SqliteLedger {
    /// Open (creating if needed) a database file.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| PaymentError::Storage(e.to_string()))?;
            }
        }
        Self::connect(&format!("sqlite:{}?mode=rwc", path.display())).await
    }

    /// Connect with a `sqlite:` URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| PaymentError::Config(format!("invalid ledger url: {e}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        tracing::info!(url = %url, "Ledger database opened");

        let ledger = Self { pool };
        ledger.run_migrations().await?;
        Ok(ledger)
    }

    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| PaymentError::Config(e.to_string()))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let ledger = Self { pool };
        ledger.run_migrations().await?;
        Ok(ledger)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| PaymentError::Storage(format!("migration failed: {e}")))?;

        tracing::debug!("Ledger migrations complete");
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn fetch_session(&self, filter: &str, value: &str) -> Result<Option<CheckoutSession>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM checkout_sessions WHERE {filter} = ? \
             ORDER BY updated_at DESC LIMIT 1"
        );
        sqlx::query_as::<_, SessionRow>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?
            .map(CheckoutSession::try_from)
            .transpose()
    }

    async fn fetch_orders(&self, sql: &str, binds: &[&str], limit: Option<i64>) -> Result<Vec<Order>> {
        let mut query = sqlx::query_as::<_, OrderRow>(sql);
        for value in binds {
            query = query.bind(*value);
        }
        if let Some(limit) = limit {
            query = query.bind(limit);
        }
        query
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Order::try_from)
            .collect()
    }
}

#[async_trait]
impl CheckoutLedger for SqliteLedger {
    async fn upsert_checkout_session(&self, input: CheckoutSessionUpsert) -> Result<String> {
        let now = now_millis();

        // Take over a session opened from the payment intent alone.
        if let Some(pi) = input
            .stripe_payment_intent_id
            .as_deref()
            .filter(|pi| *pi != input.stripe_session_id)
        {
            sqlx::query(
                "UPDATE checkout_sessions SET stripe_session_id = ? \
                 WHERE stripe_session_id = ? AND stripe_payment_intent_id = ? \
                 AND NOT EXISTS (SELECT 1 FROM checkout_sessions WHERE stripe_session_id = ?)",
            )
            .bind(&input.stripe_session_id)
            .bind(pi)
            .bind(pi)
            .bind(&input.stripe_session_id)
            .execute(&self.pool)
            .await?;
        }

        let paths = metadata_paths(&input.metadata);
        let merge = metadata_merge_expr("checkout_sessions.metadata", "excluded.metadata", paths.len());

        let sql = format!(
            "INSERT INTO checkout_sessions ({SESSION_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(stripe_session_id) DO UPDATE SET \
             stripe_payment_intent_id = COALESCE(excluded.stripe_payment_intent_id, checkout_sessions.stripe_payment_intent_id), \
             stripe_subscription_id = COALESCE(excluded.stripe_subscription_id, checkout_sessions.stripe_subscription_id), \
             offer_id = COALESCE(excluded.offer_id, checkout_sessions.offer_id), \
             lander_id = COALESCE(excluded.lander_id, checkout_sessions.lander_id), \
             customer_email = COALESCE(excluded.customer_email, checkout_sessions.customer_email), \
             metadata = {merge}, \
             status = CASE WHEN checkout_sessions.status = 'completed' THEN 'completed' ELSE excluded.status END, \
             source = excluded.source, \
             updated_at = excluded.updated_at \
             RETURNING id"
        );

        let mut query = sqlx::query_scalar::<_, String>(&sql)
            .bind(new_id())
            .bind(&input.stripe_session_id)
            .bind(&input.stripe_payment_intent_id)
            .bind(&input.stripe_subscription_id)
            .bind(&input.offer_id)
            .bind(&input.lander_id)
            .bind(&input.customer_email)
            .bind(input.metadata.to_json_string())
            .bind(input.status.as_str())
            .bind(input.source.as_str())
            .bind(now)
            .bind(now);
        for path in &paths {
            query = query.bind(path);
        }

        Ok(query.fetch_one(&self.pool).await?)
    }

    async fn update_checkout_session_status(
        &self,
        stripe_session_id: &str,
        status: SessionStatus,
        update: SessionStatusUpdate,
    ) -> Result<bool> {
        let paths = metadata_paths(&update.metadata);
        let merge = metadata_merge_expr("metadata", "?", paths.len());

        let sql = format!(
            "UPDATE checkout_sessions SET \
             stripe_payment_intent_id = COALESCE(?, stripe_payment_intent_id), \
             customer_email = COALESCE(?, customer_email), \
             status = CASE WHEN status = 'completed' THEN 'completed' ELSE ? END, \
             updated_at = ?, \
             metadata = {merge} \
             WHERE stripe_session_id = ?"
        );

        let mut query = sqlx::query(&sql)
            .bind(&update.payment_intent_id)
            .bind(&update.customer_email)
            .bind(status.as_str())
            .bind(now_millis());
        for path in &paths {
            query = query.bind(path);
        }
        if !paths.is_empty() {
            query = query.bind(update.metadata.to_json_string());
        }
        let result = query.bind(stripe_session_id).execute(&self.pool).await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_checkout_session_by_stripe_session_id(
        &self,
        stripe_session_id: &str,
    ) -> Result<Option<CheckoutSession>> {
        self.fetch_session("stripe_session_id", stripe_session_id).await
    }

    async fn find_checkout_session_by_payment_intent_id(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<CheckoutSession>> {
        self.fetch_session("stripe_payment_intent_id", payment_intent_id).await
    }

    async fn find_checkout_session_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<CheckoutSession>> {
        self.fetch_session("stripe_subscription_id", subscription_id).await
    }

    async fn upsert_order(&self, input: OrderUpsert) -> Result<String> {
        let now = now_millis();
        let paths = metadata_paths(&input.metadata);
        let merge = metadata_merge_expr("orders.metadata", "excluded.metadata", paths.len());

        let conflict = match (&input.stripe_payment_intent_id, &input.stripe_session_id) {
            (Some(_), _) => Some("ON CONFLICT(stripe_payment_intent_id)"),
            (None, Some(_)) => Some(
                "ON CONFLICT(stripe_session_id, source) \
                 WHERE stripe_payment_intent_id IS NULL AND stripe_session_id IS NOT NULL",
            ),
            (None, None) => None,
        };
        let upsert_clause = conflict
            .map(|target| format!("{target} DO UPDATE SET {ORDER_MERGE_SET}, metadata = {merge}"))
            .unwrap_or_default();

        let sql = format!(
            "INSERT INTO orders ({ORDER_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             {upsert_clause} RETURNING id"
        );

        let mut tx = self.pool.begin().await?;

        // A row recorded before the payment intent was known is adopted.
        if let (Some(pi), Some(sid)) = (&input.stripe_payment_intent_id, &input.stripe_session_id) {
            sqlx::query(
                "UPDATE orders SET stripe_payment_intent_id = ? \
                 WHERE stripe_session_id = ? AND source = ? AND stripe_payment_intent_id IS NULL \
                 AND NOT EXISTS (SELECT 1 FROM orders WHERE stripe_payment_intent_id = ?)",
            )
            .bind(pi)
            .bind(sid)
            .bind(input.source.as_str())
            .bind(pi)
            .execute(&mut *tx)
            .await?;
        }

        let mut query = sqlx::query_scalar::<_, String>(&sql)
            .bind(new_id())
            .bind(&input.checkout_session_id)
            .bind(&input.stripe_session_id)
            .bind(&input.stripe_payment_intent_id)
            .bind(&input.stripe_charge_id)
            .bind(input.amount_total)
            .bind(&input.currency)
            .bind(&input.offer_id)
            .bind(&input.lander_id)
            .bind(&input.customer_email)
            .bind(&input.customer_name)
            .bind(input.metadata.to_json_string())
            .bind(&input.payment_status)
            .bind(&input.payment_method)
            .bind(input.source.as_str())
            .bind(now)
            .bind(now);
        if conflict.is_some() {
            for path in &paths {
                query = query.bind(path);
            }
        }

        let id = query.fetch_one(&mut *tx).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn update_order_metadata(&self, update: OrderMetadataUpdate) -> Result<bool> {
        let target: Option<String> = match update.payment_intent_id.as_deref() {
            Some(pi) => sqlx::query_scalar("SELECT id FROM orders WHERE stripe_payment_intent_id = ?")
                .bind(pi)
                .fetch_optional(&self.pool)
                .await?,
            None => None,
        };
        let target = match (target, update.stripe_session_id.as_deref()) {
            (Some(id), _) => Some(id),
            (None, Some(sid)) => {
                sqlx::query_scalar(
                    "SELECT id FROM orders WHERE stripe_session_id = ? ORDER BY updated_at DESC LIMIT 1",
                )
                .bind(sid)
                .fetch_optional(&self.pool)
                .await?
            }
            (None, None) => None,
        };

        let Some(id) = target else {
            return Ok(false);
        };
        if update.metadata.is_empty() {
            return Ok(true);
        }

        let paths = metadata_paths(&update.metadata);
        let merge = metadata_merge_expr("metadata", "?", paths.len());
        let sql = format!("UPDATE orders SET updated_at = ?, metadata = {merge} WHERE id = ?");

        let mut query = sqlx::query(&sql).bind(now_millis());
        for path in &paths {
            query = query.bind(path);
        }
        let result = query
            .bind(update.metadata.to_json_string())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_order_by_payment_intent_id(&self, payment_intent_id: &str) -> Result<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE stripe_payment_intent_id = ?");
        Ok(self.fetch_orders(&sql, &[payment_intent_id], None).await?.into_iter().next())
    }

    async fn find_recent_orders_by_email(&self, email: &str, limit: u32) -> Result<Vec<Order>> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE lower(trim(customer_email)) = ? \
             ORDER BY created_at DESC, rowid DESC LIMIT ?"
        );
        let needle = email.trim().to_lowercase();
        self.fetch_orders(&sql, &[needle.as_str()], Some(i64::from(clamp_limit(limit))))
            .await
    }

    async fn find_refunded_orders(&self) -> Result<Vec<Order>> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE payment_status = 'refunded' ORDER BY updated_at DESC"
        );
        self.fetch_orders(&sql, &[], None).await
    }

    async fn mark_stale_checkout_sessions(&self, older_than: Duration) -> Result<u64> {
        let cutoff = (Utc::now() - older_than).timestamp_millis();
        let result = sqlx::query(
            "UPDATE checkout_sessions SET status = 'abandoned', updated_at = ? \
             WHERE status = 'pending' AND created_at < ?",
        )
        .bind(now_millis())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl WebhookLogStore for SqliteLedger {
    async fn find_webhook_log(&self, event_id: &str) -> Result<Option<WebhookLogEntry>> {
        let sql = format!("SELECT {WEBHOOK_COLUMNS} FROM webhook_logs WHERE event_id = ?");
        sqlx::query_as::<_, WebhookRow>(&sql)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?
            .map(WebhookLogEntry::try_from)
            .transpose()
    }

    async fn record_webhook_event(&self, update: WebhookLogUpdate) -> Result<WebhookLogEntry> {
        let now = now_millis();
        let paths = metadata_paths(&update.metadata);
        let merge = metadata_merge_expr("webhook_logs.metadata", "excluded.metadata", paths.len());

        let sql = format!(
            "INSERT INTO webhook_logs ({WEBHOOK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(event_id) DO UPDATE SET \
             event_type = excluded.event_type, \
             payment_intent_id = COALESCE(excluded.payment_intent_id, webhook_logs.payment_intent_id), \
             status = excluded.status, \
             attempts = webhook_logs.attempts + excluded.attempts, \
             last_error = CASE excluded.status \
                 WHEN 'error' THEN excluded.last_error \
                 WHEN 'success' THEN NULL \
                 ELSE webhook_logs.last_error END, \
             metadata = {merge}, \
             updated_at = excluded.updated_at \
             RETURNING {WEBHOOK_COLUMNS}"
        );

        let last_error = match update.status {
            super::WebhookStatus::Error => update.error.clone(),
            _ => None,
        };

        let mut query = sqlx::query_as::<_, WebhookRow>(&sql)
            .bind(&update.event_id)
            .bind(&update.event_type)
            .bind(&update.payment_intent_id)
            .bind(update.status.as_str())
            .bind(update.status.attempt_increment())
            .bind(last_error)
            .bind(update.metadata.to_json_string())
            .bind(now)
            .bind(now);
        for path in &paths {
            query = query.bind(path);
        }

        query.fetch_one(&self.pool).await?.try_into()
    }

    async fn count_errored_webhook_logs_since(&self, hours: i64) -> Result<u64> {
        let cutoff = (Utc::now() - Duration::hours(hours)).timestamp_millis();
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM webhook_logs WHERE status = 'error' AND updated_at >= ?",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn count_pending_webhook_logs_older_than(&self, minutes: i64) -> Result<u64> {
        let cutoff = (Utc::now() - Duration::minutes(minutes)).timestamp_millis();
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM webhook_logs WHERE status = 'pending' AND updated_at < ?",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract;
    use super::*;

    async fn test_ledger() -> SqliteLedger {
        SqliteLedger::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_ledger_contract() {
        let ledger = test_ledger().await;
        contract::run_all(&ledger).await;
    }

    #[test]
    fn test_metadata_merge_expr() {
        assert_eq!(metadata_merge_expr("metadata", "?", 0), "metadata");
        assert_eq!(
            metadata_merge_expr("orders.metadata", "excluded.metadata", 2),
            "json_patch(json_remove(orders.metadata, ?, ?), excluded.metadata)"
        );
    }

    #[test]
    fn test_metadata_paths_quote_keys() {
        let bag = MetadataBag::new().with("license.key", "x");
        assert_eq!(metadata_paths(&bag), vec!["$.\"license.key\"".to_string()]);
    }

    #[tokio::test]
    async fn test_nested_metadata_replaced_not_merged() {
        let ledger = test_ledger().await;
        let mut upsert = CheckoutSessionUpsert::new("cs_nested", SessionStatus::Pending, super::super::PaymentSource::Stripe);
        upsert.metadata = MetadataBag::from_json(serde_json::json!({ "license": { "a": 1, "b": 2 } }));
        ledger.upsert_checkout_session(upsert.clone()).await.unwrap();

        upsert.metadata = MetadataBag::from_json(serde_json::json!({ "license": { "a": 3 } }));
        ledger.upsert_checkout_session(upsert).await.unwrap();

        let session = ledger
            .find_checkout_session_by_stripe_session_id("cs_nested")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.metadata.get("license"), Some(&serde_json::json!({ "a": 3 })));
    }
}
