// ── Keystone Gateway: Credential & Quota Store ──────────────────────────────
// A long-lived `rusqlite::Connection` behind a `parking_lot::Mutex`, opened
// once at startup rather than per operation (see DESIGN.md). `token` and
// `quota` columns are field-level AES-256-GCM encrypted via `crate::crypto`;
// `init()` idempotently re-encrypts any row left over from a plaintext-era
// database.

pub mod accounts;
pub mod cache;
pub mod settings;

use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;

use crate::crypto;
use crate::error::GatewayResult;

pub struct Store {
    conn: Mutex<Connection>,
    key: [u8; 32],
}

impl Store {
    /// Opens (creating if absent) the database at `path`, enables WAL
    /// journaling, and runs `init()`.
    pub fn open(path: &Path) -> GatewayResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let key = crypto::get_master_key()?;
        let store = Store { conn: Mutex::new(conn), key };
        store.init()?;
        Ok(store)
    }

    /// In-memory store for tests — same schema, no encryption-at-rest
    /// concerns beyond using a fixed test key (no keyring in a test process).
    #[cfg(test)]
    pub fn open_in_memory() -> GatewayResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Store { conn: Mutex::new(conn), key: [0u8; 32] };
        store.init()?;
        Ok(store)
    }

    /// Ensures schema exists, then re-encrypts any row whose `token`/`quota`
    /// column is still plaintext JSON (detected by a leading `{`). Idempotent.
    fn init(&self) -> GatewayResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS accounts (
                id              TEXT PRIMARY KEY,
                provider        TEXT NOT NULL,
                email           TEXT NOT NULL,
                name            TEXT,
                avatar_url      TEXT,
                token           TEXT NOT NULL,
                quota           TEXT,
                created_at      INTEGER NOT NULL,
                last_used       INTEGER NOT NULL,
                status          TEXT NOT NULL,
                is_active       INTEGER NOT NULL DEFAULT 0,
                selected_models TEXT NOT NULL DEFAULT '[]'
            );
            CREATE TABLE IF NOT EXISTS settings (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS semantic_cache (
                id             TEXT PRIMARY KEY,
                prompt_hash    TEXT NOT NULL,
                prompt_text    TEXT NOT NULL,
                embedding      BLOB NOT NULL,
                response_text  TEXT NOT NULL,
                model          TEXT NOT NULL,
                created_at     INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cache_prompt_hash ON semantic_cache(prompt_hash);
            ",
        )?;
        drop(conn);
        self.reencrypt_plaintext_rows()?;
        Ok(())
    }

    /// Migration pass: any `token`/`quota` column still starting with `{`
    /// (i.e. raw JSON from a pre-encryption database) gets encrypted in
    /// place. Safe to run on every startup.
    fn reencrypt_plaintext_rows(&self) -> GatewayResult<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, token, quota FROM accounts")?;
        let rows: Vec<(String, String, Option<String>)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        for (id, token, quota) in rows {
            let mut needs_update = false;
            let new_token = if token.starts_with('{') {
                needs_update = true;
                crypto::encrypt(&self.key, &token)?
            } else {
                token
            };
            let new_quota = match quota {
                Some(q) if q.starts_with('{') => {
                    needs_update = true;
                    Some(crypto::encrypt(&self.key, &q)?)
                }
                other => other,
            };
            if needs_update {
                conn.execute(
                    "UPDATE accounts SET token = ?1, quota = ?2 WHERE id = ?3",
                    rusqlite::params![new_token, new_quota, id],
                )?;
            }
        }
        Ok(())
    }
}
