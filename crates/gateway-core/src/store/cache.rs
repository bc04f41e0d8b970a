// ── Keystone Gateway: Semantic Cache ────────────────────────────────────────
// Exact-hash lookup first (`SHA-256(trim(prompt))`), then a brute-force
// dot-product scan over stored unit-normalised embeddings. First match at or
// above the threshold wins; embeddings are stored as a raw little-endian
// `f32` BLOB.

use rusqlite::params;
use sha2::{Digest, Sha256};

use super::Store;
use crate::error::GatewayResult;
use crate::types::{dot_product, CacheEntry};

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.97;

pub fn prompt_hash(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

fn encode_embedding(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

impl Store {
    /// Exact hash match on the trimmed prompt text. Cache entries are stored
    /// in plaintext — they hold model output, not credentials.
    pub fn cache_find_exact(&self, prompt: &str) -> GatewayResult<Option<String>> {
        let hash = prompt_hash(prompt);
        let conn = self.conn.lock();
        let response: Option<String> = conn
            .query_row(
                "SELECT response_text FROM semantic_cache WHERE prompt_hash = ?1 LIMIT 1",
                params![hash],
                |r| r.get(0),
            )
            .optional_or_none()?;
        Ok(response)
    }

    /// Brute-force dot-product scan. Returns the first stored response whose
    /// embedding's dot product with `query_vector` is `>= threshold`.
    /// Callers are responsible for failing open (not fatal) if embedding the
    /// query failed upstream — this function only scans what's stored.
    pub fn cache_find_semantic(&self, query_vector: &[f32], threshold: f32) -> GatewayResult<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT embedding, response_text FROM semantic_cache")?;
        let rows = stmt.query_map([], |r| {
            let embedding: Vec<u8> = r.get(0)?;
            let response: String = r.get(1)?;
            Ok((embedding, response))
        })?;

        for row in rows {
            let (embedding_bytes, response) = row?;
            let embedding = decode_embedding(&embedding_bytes);
            if embedding.len() != query_vector.len() {
                continue;
            }
            if dot_product(&embedding, query_vector) >= threshold {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    /// Fire-and-forget from the caller's perspective: a failure here must
    /// never fail the client request, only be logged by the caller.
    pub fn cache_save(&self, entry: &CacheEntry) -> GatewayResult<()> {
        let embedding = encode_embedding(&entry.embedding);
        self.conn.lock().execute(
            "INSERT INTO semantic_cache
                (id, prompt_hash, prompt_text, embedding, response_text, model, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                prompt_hash = excluded.prompt_hash, prompt_text = excluded.prompt_text,
                embedding = excluded.embedding, response_text = excluded.response_text,
                model = excluded.model, created_at = excluded.created_at",
            params![
                entry.id,
                entry.prompt_hash,
                entry.prompt_text,
                embedding,
                entry.response_text,
                entry.model,
                entry.created_at,
            ],
        )?;
        Ok(())
    }
}

/// Small adapter so a missing row reads as `Ok(None)` rather than
/// `Err(QueryReturnedNoRows)`, matching `rusqlite::OptionalExtension` but
/// named for clarity at the call site above.
trait OptionalOrNone<T> {
    fn optional_or_none(self) -> rusqlite::Result<Option<T>>;
}

impl<T> OptionalOrNone<T> for rusqlite::Result<T> {
    fn optional_or_none(self) -> rusqlite::Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
