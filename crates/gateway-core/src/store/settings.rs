// ── Keystone Gateway: Settings ──────────────────────────────────────────────
// Plain key/value store, e.g. `auto_switch_enabled` (a
// setting, not a config-file field, precisely so it can be flipped at
// runtime from the CLI without a restart).

use rusqlite::{params, OptionalExtension};

use super::Store;
use crate::error::GatewayResult;

impl Store {
    pub fn get_setting(&self, key: &str, default: &str) -> GatewayResult<String> {
        let conn = self.conn.lock();
        let value: Option<String> = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |r| r.get(0))
            .optional()?;
        Ok(value.unwrap_or_else(|| default.to_string()))
    }

    pub fn set_setting(&self, key: &str, value: &str) -> GatewayResult<()> {
        self.conn.lock().execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn auto_switch_enabled(&self) -> GatewayResult<bool> {
        Ok(self.get_setting("auto_switch_enabled", "false")? == "true")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_returned_when_unset() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.get_setting("auto_switch_enabled", "false").unwrap(), "false");
    }

    #[test]
    fn set_then_get_round_trips() {
        let store = Store::open_in_memory().unwrap();
        store.set_setting("auto_switch_enabled", "true").unwrap();
        assert_eq!(store.get_setting("auto_switch_enabled", "false").unwrap(), "true");
        assert!(store.auto_switch_enabled().unwrap());
    }

    #[test]
    fn set_twice_overwrites() {
        let store = Store::open_in_memory().unwrap();
        store.set_setting("k", "v1").unwrap();
        store.set_setting("k", "v2").unwrap();
        assert_eq!(store.get_setting("k", "").unwrap(), "v2");
    }
}
