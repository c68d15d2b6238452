/// Schema for the worker database.
pub const SCHEMA: &str = r#"
-- Cache partitions in creation order (rowid) so lookups across partitions are stable
CREATE TABLE IF NOT EXISTS cache_partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Cached GET responses, one row per (partition, request identity)
CREATE TABLE IF NOT EXISTS cached_responses (
    partition TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cached_responses_key ON cached_responses(key_hash);

-- Writes waiting for delivery, per entity type, keyed by record id
CREATE TABLE IF NOT EXISTS pending_records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    entity TEXT NOT NULL,
    record_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    enqueued_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (entity, record_id)
);

CREATE TABLE IF NOT EXISTS worker_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
