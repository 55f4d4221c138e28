use rusqlite::{Connection, Result};

/// Initialise buffer and lease tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_fragments_table(conn)?;
    create_leases_table(conn)?;
    Ok(())
}

/// One row per buffered fragment. `seq` is the arrival order at the store;
/// `expires_at` is refreshed for every row of a sender on each append.
/// Times are unix milliseconds.
fn create_fragments_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS buffer_fragments (
            seq           INTEGER PRIMARY KEY AUTOINCREMENT,
            sender        TEXT NOT NULL,
            text          TEXT NOT NULL,
            display_name  TEXT NOT NULL,
            timestamp     INTEGER NOT NULL,
            appended_at   INTEGER NOT NULL,
            expires_at    INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_fragments_sender
            ON buffer_fragments(sender, seq);
        CREATE INDEX IF NOT EXISTS idx_fragments_expiry
            ON buffer_fragments(expires_at);",
    )
}

fn create_leases_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS debounce_leases (
            sender      TEXT PRIMARY KEY,
            token       TEXT NOT NULL,
            held_until  INTEGER NOT NULL
        );",
    )
}
