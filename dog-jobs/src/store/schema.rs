use rusqlite::Connection;

use crate::EngineResult;

const CREATE_TABLE: &str = "
CREATE TABLE IF NOT EXISTS dog_jobs (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    job_type       TEXT    NOT NULL,
    payload        BLOB    NOT NULL,
    priority       INTEGER NOT NULL,
    not_before     INTEGER NOT NULL,
    debounce_key   TEXT,
    saga_id        TEXT,
    correlation_id TEXT    NOT NULL,
    state          TEXT    NOT NULL DEFAULT 'pending'
                           CHECK (state IN ('pending', 'running', 'failed')),
    attempts       INTEGER NOT NULL DEFAULT 0,
    failures       INTEGER NOT NULL DEFAULT 0,
    last_error     TEXT,
    created_at     INTEGER NOT NULL,
    updated_at     INTEGER NOT NULL
);
";

// At most one pending record per debounce key, whatever path wrote it.
const CREATE_INDEX_DEBOUNCE: &str = "
CREATE UNIQUE INDEX IF NOT EXISTS idx_dog_jobs_debounce_pending
    ON dog_jobs (debounce_key)
    WHERE state = 'pending' AND debounce_key IS NOT NULL;
";

const CREATE_INDEX_READY: &str = "
CREATE INDEX IF NOT EXISTS idx_dog_jobs_ready
    ON dog_jobs (state, not_before);
";

const CREATE_INDEX_SAGA: &str = "
CREATE INDEX IF NOT EXISTS idx_dog_jobs_saga
    ON dog_jobs (saga_id)
    WHERE saga_id IS NOT NULL;
";

const CREATE_INDEX_CORRELATION: &str = "
CREATE INDEX IF NOT EXISTS idx_dog_jobs_correlation
    ON dog_jobs (correlation_id);
";

/// Create the job table and its indexes if they do not exist yet
pub fn install(conn: &Connection) -> EngineResult<()> {
    for statement in [
        CREATE_TABLE,
        CREATE_INDEX_DEBOUNCE,
        CREATE_INDEX_READY,
        CREATE_INDEX_SAGA,
        CREATE_INDEX_CORRELATION,
    ] {
        conn.execute_batch(statement)?;
    }
    Ok(())
}
