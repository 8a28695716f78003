use crate::providers::{
    ConversionRateProvider, CountryRisk, CountryRiskProvider, CountryRiskTier, PhoneType,
};
use crate::scoring::{Decision, SignalBreakdown};
use crate::state_store::StateStore;
use crate::window_counter::TrackedEvent;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Conversion history older than this is ignored.
const CONVERSION_LOOKBACK_MS: i64 = 30 * 24 * 60 * 60 * 1000;
/// Conversion rate assumed for prefixes with no history.
pub const DEFAULT_CONVERSION_RATE: f64 = 0.5;

/// One scored verification request as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckRecord {
    pub id: String,
    pub phone_number: String,
    pub phone_digits: String,
    pub phone_country: String,
    pub phone_carrier: Option<String>,
    pub phone_type: PhoneType,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
    pub fraud_score: u8,
    pub decision: Decision,
    pub signals: SignalBreakdown,
    pub created_at_ms: i64,
    pub sms_sent: bool,
    pub code_verified: bool,
}

fn parse_decision(s: &str) -> Result<Decision> {
    match s {
        "allow" => Ok(Decision::Allow),
        "review" => Ok(Decision::Review),
        "block" => Ok(Decision::Block),
        other => anyhow::bail!("Unknown decision in sms_checks: {}", other),
    }
}

impl CheckRecord {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let decision: String = row.try_get("decision")?;
        let phone_type: String = row.try_get("phone_type")?;
        let fraud_score: i64 = row.try_get("fraud_score")?;
        Ok(Self {
            id: row.try_get("id")?,
            phone_number: row.try_get("phone_number")?,
            phone_digits: row.try_get("phone_digits")?,
            phone_country: row.try_get("phone_country")?,
            phone_carrier: row.try_get("phone_carrier")?,
            phone_type: PhoneType::parse(&phone_type),
            ip_address: row.try_get("ip_address")?,
            user_agent: row.try_get("user_agent")?,
            session_id: row.try_get("session_id")?,
            fraud_score: u8::try_from(fraud_score.clamp(0, 100))?,
            decision: parse_decision(&decision)?,
            signals: SignalBreakdown {
                geo_risk: row.try_get("geo_risk")?,
                velocity_risk: row.try_get("velocity_risk")?,
                carrier_risk: row.try_get("carrier_risk")?,
                behavior_risk: row.try_get("behavior_risk")?,
            },
            created_at_ms: row.try_get("created_at_ms")?,
            sms_sent: row.try_get::<i64, _>("sms_sent")? != 0,
            code_verified: row.try_get::<i64, _>("code_verified")? != 0,
        })
    }
}

#[derive(Clone)]
pub struct DbUtils {
    pool: SqlitePool,
}

impl DbUtils {
    /// Open or create the SQLite database at the specified path.
    ///
    /// Configures the connection pool with:
    /// - max 5 connections (appropriate for SQLite's single-writer model)
    /// - 3 second acquire timeout to fail fast on overload
    ///
    /// `":memory:"` opens a private in-memory database on a single connection.
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        let in_memory = db_path.as_os_str() == ":memory:";
        let db_url = format!("sqlite://{}", db_path.display());
        let options = SqliteConnectOptions::from_str(&db_url)
            .with_context(|| format!("Invalid database path {:?}", db_path))?
            .create_if_missing(true);

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .acquire_timeout(Duration::from_secs(3));
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database {:?}", db_path))?;

        sqlx::query(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS country_risk (
                code       TEXT PRIMARY KEY,
                name       TEXT NOT NULL,
                risk_tier  TEXT NOT NULL,
                base_score REAL NOT NULL,
                fraud_rate REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sms_checks (
                id             TEXT PRIMARY KEY,
                phone_number   TEXT NOT NULL,
                phone_digits   TEXT NOT NULL,
                phone_country  TEXT NOT NULL,
                phone_carrier  TEXT,
                phone_type     TEXT NOT NULL,
                ip_address     TEXT NOT NULL,
                user_agent     TEXT,
                session_id     TEXT,
                fraud_score    INTEGER NOT NULL,
                decision       TEXT NOT NULL,
                geo_risk       REAL NOT NULL,
                velocity_risk  REAL NOT NULL,
                carrier_risk   REAL NOT NULL,
                behavior_risk  REAL NOT NULL,
                created_at_ms  INTEGER NOT NULL,
                sms_sent       INTEGER NOT NULL DEFAULT 0,
                code_verified  INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_sms_checks_digits ON sms_checks(phone_digits, created_at_ms);

            -- Per-key state behind the velocity tracker and rate limiter
            CREATE TABLE IF NOT EXISTS velocity_events (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                key          TEXT NOT NULL,
                ts           INTEGER NOT NULL,
                phone_number TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_velocity_events_key ON velocity_events(key, ts);

            CREATE TABLE IF NOT EXISTS rate_limit_events (
                id  INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL,
                ts  INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rate_limit_events_key ON rate_limit_events(key, ts);
            "#,
        )
        .execute(&pool)
        .await
        .with_context(|| "Failed to initialize schema")?;

        Ok(Self { pool })
    }

    /// Insert or replace a country's risk row. Returns true if a row was written.
    pub async fn upsert_country_risk(&self, risk: &CountryRisk) -> Result<bool> {
        log::debug!("upsert_country_risk: code={}", risk.code);
        let res = sqlx::query(
            "INSERT OR REPLACE INTO country_risk (code, name, risk_tier, base_score, fraud_rate) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(risk.code.to_uppercase())
        .bind(&risk.name)
        .bind(risk.risk_tier.as_str())
        .bind(risk.base_score)
        .bind(risk.fraud_rate)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn get_country_risk(&self, code: &str) -> Result<Option<CountryRisk>> {
        let row = sqlx::query(
            "SELECT code, name, risk_tier, base_score, fraud_rate FROM country_risk WHERE code = ?",
        )
        .bind(code.to_uppercase())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| -> Result<CountryRisk> {
            let tier: String = r.try_get("risk_tier")?;
            Ok(CountryRisk {
                code: r.try_get("code")?,
                name: r.try_get("name")?,
                risk_tier: CountryRiskTier::parse(&tier),
                base_score: r.try_get("base_score")?,
                fraud_rate: r.try_get("fraud_rate")?,
            })
        })
        .transpose()
    }

    pub async fn store_check(&self, check: &CheckRecord) -> Result<()> {
        log::debug!("store_check: id={}, decision={}", check.id, check.decision.as_str());
        sqlx::query(
            r#"
            INSERT INTO sms_checks (
                id, phone_number, phone_digits, phone_country, phone_carrier, phone_type,
                ip_address, user_agent, session_id, fraud_score, decision,
                geo_risk, velocity_risk, carrier_risk, behavior_risk,
                created_at_ms, sms_sent, code_verified
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&check.id)
        .bind(&check.phone_number)
        .bind(&check.phone_digits)
        .bind(&check.phone_country)
        .bind(&check.phone_carrier)
        .bind(check.phone_type.as_str())
        .bind(&check.ip_address)
        .bind(&check.user_agent)
        .bind(&check.session_id)
        .bind(i64::from(check.fraud_score))
        .bind(check.decision.as_str())
        .bind(check.signals.geo_risk)
        .bind(check.signals.velocity_risk)
        .bind(check.signals.carrier_risk)
        .bind(check.signals.behavior_risk)
        .bind(check.created_at_ms)
        .bind(check.sms_sent)
        .bind(check.code_verified)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[allow(dead_code)]
    pub async fn get_check(&self, id: &str) -> Result<Option<CheckRecord>> {
        let row = sqlx::query("SELECT * FROM sms_checks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(CheckRecord::from_row).transpose()
    }

    /// Record whether the SMS went out and the code was verified.
    /// Returns false if no check has that id.
    pub async fn report_outcome(&self, id: &str, sms_sent: bool, code_verified: bool) -> Result<bool> {
        log::info!(
            "report_outcome: id={}, sms_sent={}, code_verified={}",
            id,
            sms_sent,
            code_verified
        );
        let res = sqlx::query("UPDATE sms_checks SET sms_sent = ?, code_verified = ? WHERE id = ?")
            .bind(sms_sent)
            .bind(code_verified)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Share of checks under the prefix, created after `since_ms`, whose code
    /// was verified. `None` when there are no such checks.
    pub async fn conversion_rate_since(&self, phone_prefix: &str, since_ms: i64) -> Result<Option<f64>> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN code_verified = 1 THEN 1 ELSE 0 END), 0) AS verified
            FROM sms_checks
            WHERE phone_digits LIKE ? || '%'
            AND created_at_ms > ?
            "#,
        )
        .bind(phone_prefix)
        .bind(since_ms)
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.try_get("total")?;
        let verified: i64 = row.try_get("verified")?;
        if total == 0 {
            return Ok(None);
        }
        Ok(Some(verified as f64 / total as f64))
    }
}

#[async_trait]
impl CountryRiskProvider for DbUtils {
    async fn lookup(&self, country_code: &str) -> Result<Option<CountryRisk>> {
        self.get_country_risk(country_code).await
    }
}

#[async_trait]
impl ConversionRateProvider for DbUtils {
    async fn rate(&self, phone_prefix: &str, now_ms: i64) -> Result<f64> {
        let since = now_ms - CONVERSION_LOOKBACK_MS;
        Ok(self
            .conversion_rate_since(phone_prefix, since)
            .await?
            .unwrap_or(DEFAULT_CONVERSION_RATE))
    }
}

#[async_trait]
impl StateStore for DbUtils {
    async fn load_window(&self, key: &str) -> Result<Vec<TrackedEvent>> {
        let rows = sqlx::query(
            "SELECT ts, phone_number FROM velocity_events WHERE key = ? ORDER BY ts, id",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| Ok(TrackedEvent::new(r.try_get("ts")?, r.try_get::<String, _>("phone_number")?)))
            .collect()
    }

    async fn save_window(&self, key: &str, events: &[TrackedEvent]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM velocity_events WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        for event in events {
            sqlx::query("INSERT INTO velocity_events (key, ts, phone_number) VALUES (?, ?, ?)")
                .bind(key)
                .bind(event.timestamp_ms)
                .bind(&event.phone_number)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_timestamps(&self, key: &str) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT ts FROM rate_limit_events WHERE key = ? ORDER BY ts, id")
            .bind(key)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| Ok(r.try_get("ts")?)).collect()
    }

    async fn save_timestamps(&self, key: &str, timestamps: &[i64]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM rate_limit_events WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        for ts in timestamps {
            sqlx::query("INSERT INTO rate_limit_events (key, ts) VALUES (?, ?)")
                .bind(key)
                .bind(ts)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn evict_idle(&self, cutoff_ms: i64) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0usize;
        for table in ["velocity_events", "rate_limit_events"] {
            let idle = format!(
                "SELECT key FROM {table} GROUP BY key HAVING MAX(ts) < ?",
                table = table
            );
            let keys: Vec<String> = sqlx::query_scalar(&idle)
                .bind(cutoff_ms)
                .fetch_all(&mut *tx)
                .await?;
            for key in &keys {
                sqlx::query(&format!("DELETE FROM {} WHERE key = ?", table))
                    .bind(key)
                    .execute(&mut *tx)
                    .await?;
            }
            removed += keys.len();
        }
        tx.commit().await?;
        log::info!("evict_idle: removed {} idle keys", removed);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn check(id: &str, digits: &str, created_at_ms: i64) -> CheckRecord {
        CheckRecord {
            id: id.to_string(),
            phone_number: format!("+{}", digits),
            phone_digits: digits.to_string(),
            phone_country: "US".to_string(),
            phone_carrier: None,
            phone_type: PhoneType::Voip,
            ip_address: "203.0.113.7".to_string(),
            user_agent: Some("curl/8.4.0".to_string()),
            session_id: None,
            fraud_score: 42,
            decision: Decision::Review,
            signals: SignalBreakdown {
                geo_risk: 50.0,
                velocity_risk: 37.5,
                carrier_risk: 55.0,
                behavior_risk: 25.0,
            },
            created_at_ms,
            sms_sent: false,
            code_verified: false,
        }
    }

    #[tokio::test]
    async fn test_country_risk_rows() -> Result<()> {
        let db = DbUtils::new(":memory:").await?;
        assert_eq!(db.get_country_risk("NG").await?, None);

        let ng = CountryRisk {
            code: "NG".to_string(),
            name: "Nigeria".to_string(),
            risk_tier: CountryRiskTier::High,
            base_score: 70.0,
            fraud_rate: 0.12,
        };
        assert!(db.upsert_country_risk(&ng).await?);
        assert_eq!(db.get_country_risk("ng").await?, Some(ng.clone()));
        assert_eq!(CountryRiskProvider::lookup(&db, "NG").await?, Some(ng));
        Ok(())
    }

    #[tokio::test]
    async fn test_check_store_and_report() -> Result<()> {
        let db = DbUtils::new(":memory:").await?;
        let record = check("chk_1", "15550100001", 1_000);
        db.store_check(&record).await?;

        let loaded = db.get_check("chk_1").await?;
        assert_eq!(loaded, Some(record.clone()));

        assert!(db.report_outcome("chk_1", true, true).await?);
        let loaded = db.get_check("chk_1").await?.unwrap();
        assert!(loaded.sms_sent);
        assert!(loaded.code_verified);
        // Signals are stored column by column and come back exactly
        assert_eq!(loaded.signals, record.signals);

        assert!(!db.report_outcome("chk_missing", true, false).await?);
        assert_eq!(db.get_check("chk_missing").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_conversion_rate() -> Result<()> {
        let db = DbUtils::new(":memory:").await?;
        assert_eq!(db.conversion_rate_since("1555010", 0).await?, None);

        for i in 0..4 {
            db.store_check(&check(&format!("chk_{}", i), &format!("155501000{}", i), 1_000))
                .await?;
        }
        // Other prefix and too-old rows must be ignored
        db.store_check(&check("chk_other", "447700900123", 1_000)).await?;
        db.store_check(&check("chk_old", "15550100009", 10)).await?;
        db.report_outcome("chk_0", true, true).await?;
        db.report_outcome("chk_old", true, true).await?;

        assert_eq!(db.conversion_rate_since("1555010", 100).await?, Some(0.25));

        // The provider's lookback is anchored at the supplied time; from
        // there the old verified row is still inside it: 2 of 5
        assert_eq!(db.rate("1555010", 2_000).await?, 0.4);
        assert_eq!(db.rate("1555010", 1_000 + CONVERSION_LOOKBACK_MS).await?, DEFAULT_CONVERSION_RATE);
        assert_eq!(db.rate("4477009", 2_000).await?, 0.0);
        assert_eq!(db.rate("1999999", 2_000).await?, DEFAULT_CONVERSION_RATE);
        Ok(())
    }

    #[tokio::test]
    async fn test_state_store_round_trip() -> Result<()> {
        let db = DbUtils::new(":memory:").await?;
        let events = vec![
            TrackedEvent::new(1_000, "+15550100001"),
            TrackedEvent::new(2_000, "+15550100002"),
        ];
        db.save_window("ip:203.0.113.7", &events).await?;
        assert_eq!(db.load_window("ip:203.0.113.7").await?, events);

        db.save_window("ip:203.0.113.7", &events[1..]).await?;
        assert_eq!(db.load_window("ip:203.0.113.7").await?, events[1..].to_vec());

        db.save_timestamps("rl:key", &[5_000, 6_000, 7_000]).await?;
        assert_eq!(db.load_timestamps("rl:key").await?, vec![5_000, 6_000, 7_000]);

        db.save_timestamps("rl:stale", &[1]).await?;
        assert_eq!(db.evict_idle(1_500).await?, 1);
        assert!(db.load_timestamps("rl:stale").await?.is_empty());
        assert_eq!(db.load_timestamps("rl:key").await?, vec![5_000, 6_000, 7_000]);
        assert_eq!(db.load_window("ip:203.0.113.7").await?.len(), 1);
        Ok(())
    }
}
