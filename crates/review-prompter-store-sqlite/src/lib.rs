#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use review_prompter_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, KeyValueStore, StoredValue,
};
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;

const KV_MIGRATION_VERSION: i64 = 1;

const KV_COLUMNS: &[&str] = &[
    "key",
    "kind",
    "integer_value",
    "timestamps_json",
    "updated_at",
];

const SCHEMA_KV_V1: &str = r"
CREATE TABLE IF NOT EXISTS kv_entries (
  key TEXT PRIMARY KEY,
  kind TEXT NOT NULL CHECK (kind IN ('integer', 'timestamps')),
  integer_value INTEGER,
  timestamps_json TEXT,
  updated_at TEXT NOT NULL,
  CHECK (
    (kind = 'integer' AND integer_value IS NOT NULL AND timestamps_json IS NULL)
    OR (kind = 'timestamps' AND timestamps_json IS NOT NULL AND integer_value IS NULL)
  )
);
";

/// `SQLite` implementation of [`KeyValueStore`].
pub struct SqliteKeyValueStore {
    conn: Connection,
}

impl SqliteKeyValueStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                   version INTEGER PRIMARY KEY,
                   applied_at TEXT NOT NULL
                 );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_KV_V1)
            .context("failed to apply key-value schema")?;
        ensure_table_has_columns(&self.conn, "kv_entries", KV_COLUMNS)?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![KV_MIGRATION_VERSION, now],
            )
            .context("failed to register key-value schema migration")?;

        Ok(())
    }

    /// Stored keys starting with `prefix`, in ascending order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT key FROM kv_entries
                 WHERE substr(key, 1, length(?1)) = ?1
                 ORDER BY key ASC",
            )
            .context("failed to prepare key listing")?;
        let rows = stmt.query_map(params![prefix], |row| row.get::<_, String>(0))?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row.context("failed to read key row")?);
        }
        Ok(keys)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        let row = self
            .conn
            .query_row(
                "SELECT kind, integer_value, timestamps_json FROM kv_entries WHERE key = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to read key {key}"))?;

        let Some((kind, integer_value, timestamps_json)) = row else {
            return Ok(None);
        };

        match (kind.as_str(), integer_value, timestamps_json) {
            ("integer", Some(value), None) => Ok(Some(StoredValue::Integer(value))),
            ("timestamps", None, Some(raw)) => {
                let dates = decode_timestamps(&raw)
                    .with_context(|| format!("invalid stored timestamps at {key}"))?;
                Ok(Some(StoredValue::Timestamps(dates)))
            }
            (other, _, _) => Err(anyhow!("corrupt kv_entries row for {key} (kind={other})")),
        }
    }

    fn set(&mut self, key: &str, value: StoredValue) -> Result<()> {
        let (integer_value, timestamps_json) = match &value {
            StoredValue::Integer(value) => (Some(*value), None),
            StoredValue::Timestamps(dates) => (None, Some(encode_timestamps(dates)?)),
        };
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO kv_entries(key, kind, integer_value, timestamps_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(key) DO UPDATE SET
                   kind = excluded.kind,
                   integer_value = excluded.integer_value,
                   timestamps_json = excluded.timestamps_json,
                   updated_at = excluded.updated_at",
                params![key, value.kind(), integer_value, timestamps_json, now],
            )
            .with_context(|| format!("failed to write key {key}"))?;

        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM kv_entries WHERE key = ?1", params![key])
            .with_context(|| format!("failed to remove key {key}"))?;
        Ok(())
    }
}

fn encode_timestamps(dates: &[OffsetDateTime]) -> Result<String> {
    let formatted = dates
        .iter()
        .map(|date| format_rfc3339(*date).map_err(|err| anyhow!(err.to_string())))
        .collect::<Result<Vec<_>>>()?;
    serde_json::to_string(&formatted).context("failed to serialize timestamps")
}

fn decode_timestamps(raw: &str) -> Result<Vec<OffsetDateTime>> {
    let values: Vec<String> =
        serde_json::from_str(raw).context("timestamps JSON MUST be an array of strings")?;
    values
        .iter()
        .map(|value| parse_rfc3339_utc(value).map_err(|err| anyhow!(err.to_string())))
        .collect()
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "schema check failed: {table_name} is missing column {required}"
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use review_prompter_core::{
        condition_key, count_key, identifier_from_condition_key, EventCounterStore, FixedClock,
        PromptGate, PromptOutcome, CONDITION_KEY_PREFIX, PROMPT_DATES_KEY,
    };
    use time::Duration;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        match parse_rfc3339_utc(value) {
            Ok(parsed) => parsed,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        }
    }

    fn fixture_store() -> SqliteKeyValueStore {
        let store = must(SqliteKeyValueStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn temp_db_path(label: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("review-prompter-{label}-{}.sqlite3", Ulid::new()))
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = fixture_store();
        must(store.migrate());

        let applied: i64 = match store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to count migrations: {err}"),
        };
        assert_eq!(applied, 1);
    }

    #[test]
    fn missing_key_is_distinct_from_zero_and_empty() {
        let mut store = fixture_store();
        assert_eq!(must(store.get("absent")), None);

        must(store.set("zero", StoredValue::Integer(0)));
        must(store.set("empty", StoredValue::Timestamps(Vec::new())));

        assert_eq!(must(store.get("zero")), Some(StoredValue::Integer(0)));
        assert_eq!(
            must(store.get("empty")),
            Some(StoredValue::Timestamps(Vec::new()))
        );
    }

    #[test]
    fn set_overwrites_value_and_kind() {
        let mut store = fixture_store();
        must(store.set("slot", StoredValue::Integer(7)));
        must(store.set("slot", StoredValue::Integer(i64::MAX)));
        assert_eq!(must(store.get("slot")), Some(StoredValue::Integer(i64::MAX)));

        let dates = vec![must_utc("2026-02-07T12:00:00Z")];
        must(store.set("slot", StoredValue::Timestamps(dates.clone())));
        assert_eq!(must(store.get("slot")), Some(StoredValue::Timestamps(dates)));
    }

    #[test]
    fn remove_is_idempotent() {
        let mut store = fixture_store();
        must(store.set("slot", StoredValue::Integer(1)));
        must(store.remove("slot"));
        must(store.remove("slot"));
        assert_eq!(must(store.get("slot")), None);
    }

    #[test]
    fn timestamps_keep_subsecond_precision_across_reopen() {
        let db_path = temp_db_path("precision");
        let dates = vec![
            must_utc("2026-02-07T12:00:00Z"),
            must_utc("2026-02-07T12:00:00.000000001Z"),
            must_utc("2026-02-08T09:30:15.123456789Z"),
        ];

        {
            let mut store = must(SqliteKeyValueStore::open(&db_path));
            must(store.migrate());
            must(store.set(PROMPT_DATES_KEY, StoredValue::Timestamps(dates.clone())));
        }

        let store = must(SqliteKeyValueStore::open(&db_path));
        must(store.migrate());
        assert_eq!(
            must(store.get(PROMPT_DATES_KEY)),
            Some(StoredValue::Timestamps(dates))
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn corrupt_timestamps_are_reported_clearly() {
        let store = fixture_store();
        if let Err(err) = store.connection().execute(
            "INSERT INTO kv_entries(key, kind, integer_value, timestamps_json, updated_at)
             VALUES ('bad', 'timestamps', NULL, '[\"not-a-date\"]', '2026-02-07T12:00:00Z')",
            [],
        ) {
            panic!("failed to seed corrupt row: {err}");
        }

        let err = match store.get("bad") {
            Ok(value) => panic!("expected error, got {value:?}"),
            Err(err) => format!("{err:#}"),
        };
        assert!(err.contains("invalid stored timestamps at bad"), "{err}");
    }

    #[test]
    fn corrupt_prompt_history_is_replaced_on_next_request() {
        let store = fixture_store();
        if let Err(err) = store.connection().execute(
            "INSERT INTO kv_entries(key, kind, integer_value, timestamps_json, updated_at)
             VALUES (?1, 'timestamps', NULL, '[\"not-a-date\"]', '2026-02-07T12:00:00Z')",
            [PROMPT_DATES_KEY],
        ) {
            panic!("failed to seed corrupt row: {err}");
        }

        let now = must_utc("2026-02-07T12:00:00Z");
        let mut gate = match PromptGate::new(
            EventCounterStore::new(store),
            Duration::seconds(2),
            FixedClock(now),
            || {},
        ) {
            Ok(gate) => gate,
            Err(err) => panic!("gate construction failed: {err}"),
        };
        assert!(gate.history().is_err());

        assert!(gate.request_trigger());
        assert_eq!(gate.history(), Ok(vec![now]));
        assert!(!gate.request_trigger());
    }

    #[test]
    fn schema_rejects_mismatched_kind_columns() {
        let store = fixture_store();
        let result = store.connection().execute(
            "INSERT INTO kv_entries(key, kind, integer_value, timestamps_json, updated_at)
             VALUES ('bad', 'integer', NULL, NULL, '2026-02-07T12:00:00Z')",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn migrate_fails_for_incompatible_existing_table() {
        let store = must(SqliteKeyValueStore::open(Path::new(":memory:")));
        if let Err(err) = store
            .connection()
            .execute_batch("CREATE TABLE kv_entries (key TEXT PRIMARY KEY, value TEXT);")
        {
            panic!("failed to seed legacy table: {err}");
        }

        let err = match store.migrate() {
            Ok(()) => panic!("expected migrate to fail"),
            Err(err) => err.to_string(),
        };
        assert!(err.contains("missing column kind"), "{err}");
    }

    #[test]
    fn keys_with_prefix_lists_registered_events() {
        let mut counters = EventCounterStore::new(fixture_store());
        for identifier in ["launch", "share", "export_100%_done"] {
            if let Err(err) = counters.register(identifier, 2) {
                panic!("register failed: {err}");
            }
        }

        let keys = must(counters.store().keys_with_prefix(CONDITION_KEY_PREFIX));
        let identifiers = keys
            .iter()
            .filter_map(|key| identifier_from_condition_key(key))
            .collect::<Vec<_>>();
        assert_eq!(identifiers, vec!["export_100%_done", "launch", "share"]);
    }

    #[test]
    fn counters_and_history_survive_restart() {
        let db_path = temp_db_path("restart");
        let now = must_utc("2026-02-07T12:00:00Z");

        {
            let mut store = must(SqliteKeyValueStore::open(&db_path));
            must(store.migrate());
            let mut counters = EventCounterStore::new(store);
            if let Err(err) = counters.register("launch", 2) {
                panic!("register failed: {err}");
            }
            if let Err(err) = counters.increment("launch") {
                panic!("increment failed: {err}");
            }
            let mut gate = match PromptGate::new(counters, Duration::days(1), FixedClock(now), || {}) {
                Ok(gate) => gate,
                Err(err) => panic!("gate construction failed: {err}"),
            };
            assert!(gate.request_trigger());
        }

        let store = must(SqliteKeyValueStore::open(&db_path));
        must(store.migrate());
        assert_eq!(must(store.get(&count_key("launch"))), Some(StoredValue::Integer(1)));
        assert_eq!(
            must(store.get(&condition_key("launch"))),
            Some(StoredValue::Integer(2))
        );

        let mut gate = match PromptGate::new(
            EventCounterStore::new(store),
            Duration::days(1),
            FixedClock(now + Duration::hours(1)),
            || {},
        ) {
            Ok(gate) => gate,
            Err(err) => panic!("gate construction failed: {err}"),
        };
        assert_eq!(
            gate.increment_and_maybe_trigger("launch"),
            Ok(PromptOutcome::DeniedByCooldown)
        );
        assert_eq!(gate.counters().count("launch"), 2);

        let _ = std::fs::remove_file(&db_path);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_arbitrary_identifiers_are_isolated_keys(identifier in "\\PC{1,24}", condition in 1u32..5) {
            let mut counters = EventCounterStore::new(fixture_store());
            if let Err(err) = counters.register(&identifier, condition) {
                panic!("register failed: {err}");
            }
            if let Err(err) = counters.increment(&identifier) {
                panic!("increment failed: {err}");
            }

            prop_assert_eq!(counters.count(&identifier), 1);
            prop_assert_eq!(counters.has_met_condition(&identifier), condition == 1);
            let other = format!("{identifier}_other");
            prop_assert_eq!(counters.count(&other), 0);
        }
    }
}
