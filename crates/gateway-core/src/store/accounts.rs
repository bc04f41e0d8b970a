// ── Keystone Gateway: Account CRUD ──────────────────────────────────────────
// `token`/`quota` are encrypted at the column level; everything else (id,
// provider, email, status, timestamps) stays plaintext since it is needed for
// indexing/ordering and carries no secret material.

use rusqlite::{params, OptionalExtension};

use super::Store;
use crate::crypto;
use crate::error::{GatewayError, GatewayResult};
use crate::types::{Account, AccountStatus, Provider, QuotaMap, TokenRecord};

impl Store {
    pub fn add(&self, account: &Account) -> GatewayResult<()> {
        let token_json = serde_json::to_string(&account.token)?;
        let token_enc = crypto::encrypt(&self.key, &token_json)?;
        let quota_enc = match &account.quota {
            Some(q) => Some(crypto::encrypt(&self.key, &serde_json::to_string(q)?)?),
            None => None,
        };
        let selected_models = serde_json::to_string(&account.selected_models)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if account.is_active {
            tx.execute("UPDATE accounts SET is_active = 0 WHERE id != ?1", params![account.id])?;
        }
        tx.execute(
            "INSERT INTO accounts
                (id, provider, email, name, avatar_url, token, quota, created_at, last_used, status, is_active, selected_models)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                provider = excluded.provider, email = excluded.email, name = excluded.name,
                avatar_url = excluded.avatar_url, token = excluded.token, quota = excluded.quota,
                created_at = excluded.created_at, last_used = excluded.last_used, status = excluded.status,
                is_active = excluded.is_active, selected_models = excluded.selected_models",
            params![
                account.id,
                account.provider.as_str(),
                account.email,
                account.name,
                account.avatar_url,
                token_enc,
                quota_enc,
                account.created_at,
                account.last_used,
                status_str(account.status),
                account.is_active as i64,
                selected_models,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn list(&self) -> GatewayResult<Vec<Account>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, provider, email, name, avatar_url, token, quota, created_at, last_used, status, is_active, selected_models
             FROM accounts ORDER BY last_used DESC",
        )?;
        let rows = stmt.query_map([], row_to_raw)?;

        let mut accounts = Vec::new();
        for row in rows {
            let raw = row?;
            match self.decode_account(raw) {
                Ok(account) => accounts.push(account),
                Err(e) => log::warn!("skipping account row with decrypt error: {e}"),
            }
        }
        Ok(accounts)
    }

    pub fn get(&self, id: &str) -> GatewayResult<Option<Account>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                "SELECT id, provider, email, name, avatar_url, token, quota, created_at, last_used, status, is_active, selected_models
                 FROM accounts WHERE id = ?1",
                params![id],
                row_to_raw,
            )
            .optional()?;
        drop(conn);
        raw.map(|r| self.decode_account(r)).transpose()
    }

    pub fn remove(&self, id: &str) -> GatewayResult<()> {
        self.conn.lock().execute("DELETE FROM accounts WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn update_token(&self, id: &str, token: &TokenRecord) -> GatewayResult<()> {
        let token_enc = crypto::encrypt(&self.key, &serde_json::to_string(token)?)?;
        self.conn
            .lock()
            .execute("UPDATE accounts SET token = ?1 WHERE id = ?2", params![token_enc, id])?;
        Ok(())
    }

    pub fn update_quota(&self, id: &str, quota: &QuotaMap) -> GatewayResult<()> {
        let quota_enc = crypto::encrypt(&self.key, &serde_json::to_string(quota)?)?;
        self.conn
            .lock()
            .execute("UPDATE accounts SET quota = ?1 WHERE id = ?2", params![quota_enc, id])?;
        Ok(())
    }

    pub fn update_selected_models(&self, id: &str, models: &[String]) -> GatewayResult<()> {
        let json = serde_json::to_string(models)?;
        self.conn
            .lock()
            .execute("UPDATE accounts SET selected_models = ?1 WHERE id = ?2", params![json, id])?;
        Ok(())
    }

    pub fn update_status(&self, id: &str, status: AccountStatus) -> GatewayResult<()> {
        self.conn
            .lock()
            .execute("UPDATE accounts SET status = ?1 WHERE id = ?2", params![status_str(status), id])?;
        Ok(())
    }

    pub fn update_last_used(&self, id: &str, now: i64) -> GatewayResult<()> {
        self.conn
            .lock()
            .execute("UPDATE accounts SET last_used = ?1 WHERE id = ?2", params![now, id])?;
        Ok(())
    }

    /// Transactionally demotes every other account's `is_active` flag and
    /// promotes `id`. Fails if `id` does not exist.
    pub fn set_active(&self, id: &str) -> GatewayResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("UPDATE accounts SET is_active = 0 WHERE id != ?1", params![id])?;
        let updated = tx.execute("UPDATE accounts SET is_active = 1 WHERE id = ?1", params![id])?;
        if updated == 0 {
            return Err(GatewayError::NoAccount { model: id.to_string() });
        }
        tx.commit()?;
        Ok(())
    }

    fn decode_account(&self, raw: RawAccountRow) -> GatewayResult<Account> {
        let token_json = crypto::decrypt(&self.key, &raw.token)
            .map_err(|e| GatewayError::Decrypt { id: raw.id.clone(), message: e.to_string() })?;
        let token: TokenRecord = serde_json::from_str(&token_json)
            .map_err(|e| GatewayError::Decrypt { id: raw.id.clone(), message: e.to_string() })?;

        let quota = match raw.quota {
            Some(enc) => {
                let json = crypto::decrypt(&self.key, &enc)
                    .map_err(|e| GatewayError::Decrypt { id: raw.id.clone(), message: e.to_string() })?;
                Some(
                    serde_json::from_str::<QuotaMap>(&json)
                        .map_err(|e| GatewayError::Decrypt { id: raw.id.clone(), message: e.to_string() })?,
                )
            }
            None => None,
        };

        let provider = Provider::from_str(&raw.provider)
            .ok_or_else(|| GatewayError::Storage(rusqlite::Error::InvalidColumnType(
                0,
                "provider".into(),
                rusqlite::types::Type::Text,
            )))?;
        let status = status_from_str(&raw.status);
        let selected_models: Vec<String> = serde_json::from_str(&raw.selected_models)?;

        Ok(Account {
            id: raw.id,
            provider,
            email: raw.email,
            name: raw.name,
            avatar_url: raw.avatar_url,
            token,
            quota,
            created_at: raw.created_at,
            last_used: raw.last_used,
            status,
            is_active: raw.is_active != 0,
            selected_models,
        })
    }
}

struct RawAccountRow {
    id: String,
    provider: String,
    email: String,
    name: Option<String>,
    avatar_url: Option<String>,
    token: String,
    quota: Option<String>,
    created_at: i64,
    last_used: i64,
    status: String,
    is_active: i64,
    selected_models: String,
}

fn row_to_raw(row: &rusqlite::Row) -> rusqlite::Result<RawAccountRow> {
    Ok(RawAccountRow {
        id: row.get(0)?,
        provider: row.get(1)?,
        email: row.get(2)?,
        name: row.get(3)?,
        avatar_url: row.get(4)?,
        token: row.get(5)?,
        quota: row.get(6)?,
        created_at: row.get(7)?,
        last_used: row.get(8)?,
        status: row.get(9)?,
        is_active: row.get(10)?,
        selected_models: row.get(11)?,
    })
}

fn status_str(status: AccountStatus) -> &'static str {
    match status {
        AccountStatus::Active => "active",
        AccountStatus::Refreshing => "refreshing",
        AccountStatus::RateLimited => "rate_limited",
        AccountStatus::Error => "error",
    }
}

fn status_from_str(s: &str) -> AccountStatus {
    match s {
        "refreshing" => AccountStatus::Refreshing,
        "rate_limited" => AccountStatus::RateLimited,
        "error" => AccountStatus::Error,
        _ => AccountStatus::Active,
    }
}
