//! Message log: SQLite table of every incoming and outgoing message.
//!
//! Appends are single `INSERT ... RETURNING` statements, so concurrent writers never share an
//! id and readers never see half-written rows. WAL mode lets reads proceed while a write holds
//! the lock; `busy_timeout` queues competing writers.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL CHECK(length(user_id) > 0),
    channel_id TEXT NOT NULL CHECK(length(channel_id) > 0),
    text TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    direction TEXT NOT NULL CHECK(direction IN ('incoming', 'outgoing')),
    dedup_key TEXT UNIQUE,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
CREATE INDEX IF NOT EXISTS idx_messages_user ON messages(user_id);
CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages(channel_id);
CREATE INDEX IF NOT EXISTS idx_messages_direction ON messages(direction);
"#;

const COLUMNS: &str = "id, user_id, channel_id, text, timestamp, direction, dedup_key, metadata";

pub const DEFAULT_QUERY_LIMIT: u32 = 100;
pub const MAX_QUERY_LIMIT: u32 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid message: {0}")]
    Invalid(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

/// Which way a message travelled relative to this relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "incoming" => Ok(Direction::Incoming),
            "outgoing" => Ok(Direction::Outgoing),
            other => Err(format!("unknown direction: {}", other)),
        }
    }
}

/// A message ready to be appended. `timestamp` defaults to the append time when None.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub user_id: String,
    pub channel_id: String,
    pub text: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub direction: Direction,
    /// Identifies one upstream event; a second append with the same key returns the first record.
    pub dedup_key: Option<String>,
    pub metadata: Map<String, Value>,
}

/// A persisted message. Serialized with the field names the HTTP API has always used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub user_id: String,
    pub channel_id: String,
    #[serde(rename = "message_text")]
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    #[serde(skip)]
    pub dedup_key: Option<String>,
    pub metadata: Map<String, Value>,
}

/// Query filter; all fields optional and AND-combined.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    pub user_id: Option<String>,
    pub channel_id: Option<String>,
    pub direction: Option<Direction>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl MessageFilter {
    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .min(MAX_QUERY_LIMIT)
    }

    pub fn effective_offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    user_id: String,
    channel_id: String,
    text: String,
    timestamp: String,
    direction: String,
    dedup_key: Option<String>,
    metadata: String,
}

impl TryFrom<MessageRow> for StoredMessage {
    type Error = StorageError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StorageError::Corrupt { id: row.id, reason };
        let timestamp = DateTime::parse_from_rfc3339(&row.timestamp)
            .map_err(|e| corrupt(format!("timestamp: {}", e)))?
            .with_timezone(&Utc);
        let direction = row.direction.parse::<Direction>().map_err(corrupt)?;
        let metadata = match serde_json::from_str::<Value>(&row.metadata)
            .map_err(|e| corrupt(format!("metadata: {}", e)))?
        {
            Value::Object(map) => map,
            _ => return Err(corrupt("metadata is not an object".to_string())),
        };
        Ok(StoredMessage {
            id: row.id,
            user_id: row.user_id,
            channel_id: row.channel_id,
            text: row.text,
            timestamp,
            direction,
            dedup_key: row.dedup_key,
            metadata,
        })
    }
}

/// Fixed-width UTC form so that text ordering matches time ordering.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Handle to the message log. Cheap to clone (shares the pool).
#[derive(Debug, Clone)]
pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    /// Open or create the database file (and parent directories) and ensure the schema exists.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory: {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to message database: {}", path.display()))?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    /// In-memory database on a single pinned connection (for tests and throwaway runs).
    pub async fn in_memory() -> anyhow::Result<Self> {
        use anyhow::Context;

        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("parsing in-memory database URL")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("connecting to in-memory database")?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> anyhow::Result<()> {
        use anyhow::Context;

        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("initializing message database schema")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Persist a message and return the stored record.
    ///
    /// `metadata.direction` is always overwritten with the record's direction. If `dedup_key`
    /// is already present the existing row is returned and nothing is written.
    pub async fn append(&self, message: NewMessage) -> Result<StoredMessage, StorageError> {
        if message.user_id.trim().is_empty() {
            return Err(StorageError::Invalid("user_id is required".to_string()));
        }
        if message.channel_id.trim().is_empty() {
            return Err(StorageError::Invalid("channel_id is required".to_string()));
        }

        let timestamp = format_timestamp(message.timestamp.unwrap_or_else(Utc::now));
        let mut metadata = message.metadata;
        metadata.insert(
            "direction".to_string(),
            Value::String(message.direction.as_str().to_string()),
        );
        let metadata = Value::Object(metadata).to_string();

        let inserted = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO messages (user_id, channel_id, text, timestamp, direction, dedup_key, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(dedup_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&message.user_id)
        .bind(&message.channel_id)
        .bind(&message.text)
        .bind(&timestamp)
        .bind(message.direction.as_str())
        .bind(&message.dedup_key)
        .bind(&metadata)
        .fetch_optional(&self.pool)
        .await?;

        match (inserted, message.dedup_key.as_deref()) {
            (Some(id), _) => self.get(id).await,
            (None, Some(key)) => {
                log::debug!("store: dedup key {} already recorded", key);
                self.get_by_dedup_key(key).await
            }
            (None, None) => Err(StorageError::Invalid(
                "insert returned no row".to_string(),
            )),
        }
    }

    pub async fn get(&self, id: i64) -> Result<StoredMessage, StorageError> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {} FROM messages WHERE id = ?",
            COLUMNS
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_by_dedup_key(&self, key: &str) -> Result<StoredMessage, StorageError> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {} FROM messages WHERE dedup_key = ?",
            COLUMNS
        ))
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    /// Messages matching the filter, newest first (ties broken by id, highest first).
    pub async fn query(&self, filter: &MessageFilter) -> Result<Vec<StoredMessage>, StorageError> {
        let mut qb: sqlx::QueryBuilder<sqlx::Sqlite> =
            sqlx::QueryBuilder::new(format!("SELECT {} FROM messages WHERE 1 = 1", COLUMNS));
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY timestamp DESC, id DESC LIMIT ");
        qb.push_bind(i64::from(filter.effective_limit()));
        qb.push(" OFFSET ");
        qb.push_bind(i64::from(filter.effective_offset()));

        let rows = qb
            .build_query_as::<MessageRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(StoredMessage::try_from).collect()
    }

    /// Total rows matching the filter, ignoring limit and offset.
    pub async fn count(&self, filter: &MessageFilter) -> Result<i64, StorageError> {
        let mut qb: sqlx::QueryBuilder<sqlx::Sqlite> =
            sqlx::QueryBuilder::new("SELECT COUNT(*) FROM messages WHERE 1 = 1");
        push_filter(&mut qb, filter);
        let n = qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// True when the database answers a trivial query.
    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

fn push_filter(qb: &mut sqlx::QueryBuilder<'_, sqlx::Sqlite>, filter: &MessageFilter) {
    if let Some(user_id) = &filter.user_id {
        qb.push(" AND user_id = ");
        qb.push_bind(user_id.clone());
    }
    if let Some(channel_id) = &filter.channel_id {
        qb.push(" AND channel_id = ");
        qb.push_bind(channel_id.clone());
    }
    if let Some(direction) = filter.direction {
        qb.push(" AND direction = ");
        qb.push_bind(direction.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn msg(user: &str, channel: &str, text: &str) -> NewMessage {
        NewMessage {
            user_id: user.to_string(),
            channel_id: channel.to_string(),
            text: text.to_string(),
            timestamp: None,
            direction: Direction::Incoming,
            dedup_key: None,
            metadata: Map::new(),
        }
    }

    fn filter() -> MessageFilter {
        MessageFilter::default()
    }

    #[tokio::test]
    async fn append_then_query_by_user_round_trips() {
        let store = MessageStore::in_memory().await.unwrap();
        let mut m = msg("U1", "C1", "hello");
        m.metadata
            .insert("transportTimestamp".to_string(), Value::from("1700000000.000100"));
        let stored = store.append(m.clone()).await.unwrap();

        let found = store
            .query(&MessageFilter {
                user_id: Some("U1".to_string()),
                ..filter()
            })
            .await
            .unwrap();
        assert_eq!(found, vec![stored.clone()]);
        assert_eq!(stored.user_id, m.user_id);
        assert_eq!(stored.channel_id, m.channel_id);
        assert_eq!(stored.text, m.text);
        assert_eq!(stored.direction, Direction::Incoming);
        assert_eq!(stored.metadata["direction"], "incoming");
        assert_eq!(stored.metadata["transportTimestamp"], "1700000000.000100");
    }

    #[tokio::test]
    async fn filters_combine_with_and() {
        let store = MessageStore::in_memory().await.unwrap();
        store.append(msg("U1", "C1", "one")).await.unwrap();
        store.append(msg("U1", "C2", "two")).await.unwrap();
        store.append(msg("U2", "C1", "three")).await.unwrap();

        let by_user = MessageFilter {
            user_id: Some("U1".to_string()),
            ..filter()
        };
        let by_channel = MessageFilter {
            channel_id: Some("C1".to_string()),
            ..filter()
        };
        let both = MessageFilter {
            user_id: Some("U1".to_string()),
            channel_id: Some("C1".to_string()),
            ..filter()
        };
        assert_eq!(store.query(&filter()).await.unwrap().len(), 3);
        assert_eq!(store.query(&by_user).await.unwrap().len(), 2);
        assert_eq!(store.query(&by_channel).await.unwrap().len(), 2);
        assert_eq!(store.query(&both).await.unwrap().len(), 1);
        assert_eq!(store.count(&by_user).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn direction_filter_matches_metadata_direction() {
        let store = MessageStore::in_memory().await.unwrap();
        store.append(msg("U1", "C1", "in")).await.unwrap();
        let mut out = msg("U1", "C1", "out");
        out.direction = Direction::Outgoing;
        store.append(out).await.unwrap();

        let outgoing = store
            .query(&MessageFilter {
                direction: Some(Direction::Outgoing),
                ..filter()
            })
            .await
            .unwrap();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].text, "out");
        assert_eq!(outgoing[0].metadata["direction"], "outgoing");
    }

    #[tokio::test]
    async fn newest_first_with_limit_and_offset() {
        let store = MessageStore::in_memory().await.unwrap();
        for (i, text) in ["t1", "t2", "t3"].iter().enumerate() {
            let mut m = msg("U1", "C1", text);
            m.timestamp = Some(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, i as u32).unwrap());
            store.append(m).await.unwrap();
        }

        let top = store
            .query(&MessageFilter {
                limit: Some(2),
                ..filter()
            })
            .await
            .unwrap();
        let texts: Vec<&str> = top.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["t3", "t2"]);

        let rest = store
            .query(&MessageFilter {
                limit: Some(2),
                offset: Some(2),
                ..filter()
            })
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].text, "t1");
    }

    #[tokio::test]
    async fn equal_timestamps_fall_back_to_id_order() {
        let store = MessageStore::in_memory().await.unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let mut ids = Vec::new();
        for text in ["a", "b"] {
            let mut m = msg("U1", "C1", text);
            m.timestamp = Some(ts);
            ids.push(store.append(m).await.unwrap().id);
        }
        let found = store.query(&filter()).await.unwrap();
        assert_eq!(found[0].id, ids[1]);
        assert_eq!(found[1].id, ids[0]);
    }

    #[tokio::test]
    async fn duplicate_dedup_key_returns_existing_record() {
        let store = MessageStore::in_memory().await.unwrap();
        let mut m = msg("U1", "C1", "once");
        m.dedup_key = Some("Ev1:1700000000.000100".to_string());
        let first = store.append(m.clone()).await.unwrap();
        let second = store.append(m).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.count(&filter()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_text_is_allowed_but_ids_are_required() {
        let store = MessageStore::in_memory().await.unwrap();
        assert!(store.append(msg("U1", "C1", "")).await.is_ok());
        assert!(matches!(
            store.append(msg("", "C1", "x")).await,
            Err(StorageError::Invalid(_))
        ));
        assert!(matches!(
            store.append(msg("U1", " ", "x")).await,
            Err(StorageError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_appends_get_distinct_ids() {
        let temp = TempDir::new().unwrap();
        let store = MessageStore::open(&temp.path().join("log.db")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append(msg(&format!("U{}", i % 3), "C1", &format!("m{}", i)))
                    .await
                    .unwrap()
                    .id
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 20);
        assert_eq!(store.count(&filter()).await.unwrap(), 20);
        store.close().await;
    }

    #[tokio::test]
    async fn open_creates_file_and_reopen_keeps_rows() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("log.db");
        {
            let store = MessageStore::open(&path).await.unwrap();
            assert!(store.is_healthy().await);
            store.append(msg("U1", "C1", "persisted")).await.unwrap();
            store.close().await;
        }
        assert!(path.exists());
        let store = MessageStore::open(&path).await.unwrap();
        let found = store.query(&filter()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].text, "persisted");
    }

    #[test]
    fn limit_defaults_and_caps() {
        assert_eq!(filter().effective_limit(), DEFAULT_QUERY_LIMIT);
        let big = MessageFilter {
            limit: Some(50_000),
            ..filter()
        };
        assert_eq!(big.effective_limit(), MAX_QUERY_LIMIT);
    }

    #[test]
    fn timestamp_format_is_fixed_width() {
        let a = format_timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(a, "2024-01-01T00:00:00.000000Z");
    }
}
