use std::{collections::HashMap, fmt, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, aio::ConnectionManager};
use serde_json::Value;
use tracing::{debug, info};

use super::sessions::{
    ChunkSessionStore, ChunkStoreOutcome, ChunkSubmission, ExpiredUpload, MultipartSessionStore,
    MultipartUploadState, ReassembledUpload, UploadedPart, validate_chunk,
};
use crate::{
    error::{KilnError, Result},
    types::SessionId,
};

/// Redis scripts for atomic session operations
mod scripts {
    use redis::Script;

    /// Stores a chunk and, when it was the last one, concatenates the session,
    /// deletes it and leaves a tombstone in one step.
    pub fn store_chunk() -> Script {
        Script::new(
            r#"
            local chunks = KEYS[1]
            local meta = KEYS[2]
            local done = KEYS[3]
            local index = ARGV[1]
            local total = tonumber(ARGV[2])
            local data = ARGV[3]
            local metadata = ARGV[4]
            local session_ttl = tonumber(ARGV[5])
            local tombstone_ttl = tonumber(ARGV[6])

            local consumed = redis.call('GET', done)
            if consumed then
                return {'consumed', consumed}
            end

            local stored_total = redis.call('HGET', meta, 'total')
            if stored_total then
                if tonumber(stored_total) ~= total then
                    return {'mismatch', stored_total}
                end
            else
                redis.call('HSET', meta, 'total', total, 'metadata', metadata)
            end

            redis.call('HSET', chunks, index, data)
            redis.call('EXPIRE', chunks, session_ttl)
            redis.call('EXPIRE', meta, session_ttl)

            local received = redis.call('HLEN', chunks)
            if received < total then
                return {'pending', tostring(received)}
            end

            local parts = {}
            for i = 0, total - 1 do
                parts[#parts + 1] = redis.call('HGET', chunks, tostring(i))
            end
            local stored_meta = redis.call('HGET', meta, 'metadata')
            redis.call('DEL', chunks, meta)
            redis.call('SET', done, total, 'EX', tombstone_ttl)
            return {'complete', stored_meta, table.concat(parts)}
            "#,
        )
    }

    /// Records a part etag only while the session record exists.
    pub fn record_part() -> Script {
        Script::new(
            r#"
            if redis.call('EXISTS', KEYS[1]) == 0 then
                return 0
            end
            redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
            redis.call('EXPIRE', KEYS[2], tonumber(ARGV[3]))
            return 1
            "#,
        )
    }
}

/// Opens a managed connection shared by the Redis session stores.
pub async fn connect(redis_url: &str) -> Result<ConnectionManager> {
    info!("Connecting to Redis session store at {}", redis_url);
    let client = redis::Client::open(redis_url)
        .map_err(|e| KilnError::SessionStore(format!("Failed to create Redis client: {e}")))?;
    let conn = ConnectionManager::new(client)
        .await
        .map_err(|e| KilnError::SessionStore(format!("Failed to connect to Redis: {e}")))?;
    info!("Successfully connected to Redis session store");
    Ok(conn)
}

fn utf8(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

fn parse_u32(raw: &[u8]) -> Result<u32> {
    utf8(raw)
        .parse()
        .map_err(|e| KilnError::SessionStore(format!("unexpected counter in session store: {e}")))
}

/// Chunk sessions shared across server instances.
#[derive(Clone)]
pub struct RedisChunkSessionStore {
    conn: ConnectionManager,
    prefix: String,
    session_ttl: Duration,
    tombstone_ttl: Duration,
}

impl fmt::Debug for RedisChunkSessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisChunkSessionStore")
            .field("connection", &"ConnectionManager")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RedisChunkSessionStore {
    pub fn new(
        conn: ConnectionManager,
        prefix: impl Into<String>,
        session_ttl: Duration,
        tombstone_ttl: Duration,
    ) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            session_ttl,
            tombstone_ttl,
        }
    }

    fn keys(&self, session_id: &SessionId) -> (String, String, String) {
        let base = format!("{}:chunks:{}", self.prefix, session_id);
        (base.clone(), format!("{base}:meta"), format!("{base}:done"))
    }
}

#[async_trait]
impl ChunkSessionStore for RedisChunkSessionStore {
    async fn store_chunk(&self, submission: ChunkSubmission) -> Result<ChunkStoreOutcome> {
        validate_chunk(&submission, u32::MAX)?;
        let (chunks, meta, done) = self.keys(&submission.session_id);
        let metadata = serde_json::to_string(&submission.metadata)?;
        let mut conn = self.conn.clone();

        let reply: Vec<Vec<u8>> = scripts::store_chunk()
            .key(&chunks)
            .key(&meta)
            .key(&done)
            .arg(submission.index)
            .arg(submission.total_chunks)
            .arg(submission.bytes.as_slice())
            .arg(metadata)
            .arg(self.session_ttl.as_secs().max(1))
            .arg(self.tombstone_ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;

        let Some((kind, rest)) = reply.split_first() else {
            return Err(KilnError::SessionStore("empty reply from chunk script".into()));
        };
        match (kind.as_slice(), rest) {
            (b"pending", [received]) => Ok(ChunkStoreOutcome::Pending {
                received: parse_u32(received)?,
                total: submission.total_chunks,
            }),
            (b"consumed", [total]) => Ok(ChunkStoreOutcome::AlreadyConsumed {
                total: parse_u32(total)?,
            }),
            (b"mismatch", [stored]) => Err(KilnError::InvalidInput(format!(
                "session {} was opened with {} chunks, not {}",
                submission.session_id,
                utf8(stored),
                submission.total_chunks
            ))),
            (b"complete", [stored_meta, bytes]) => {
                let metadata: Value = serde_json::from_slice(stored_meta)?;
                debug!(
                    session = %submission.session_id,
                    bytes = bytes.len(),
                    "chunk session complete"
                );
                Ok(ChunkStoreOutcome::Complete(ReassembledUpload {
                    session_id: submission.session_id,
                    total_chunks: submission.total_chunks,
                    metadata,
                    bytes: bytes.clone(),
                }))
            }
            _ => Err(KilnError::SessionStore(format!(
                "unexpected reply from chunk script: {}",
                utf8(kind)
            ))),
        }
    }

    async fn progress(&self, session_id: &SessionId) -> Result<Option<(u32, u32)>> {
        let (chunks, meta, _) = self.keys(session_id);
        let mut conn = self.conn.clone();
        let total: Option<u32> = conn.hget(&meta, "total").await?;
        let Some(total) = total else {
            return Ok(None);
        };
        let received: u32 = conn.hlen(&chunks).await?;
        Ok(Some((received, total)))
    }
}

/// Multipart session records shared across server instances.
#[derive(Clone)]
pub struct RedisMultipartSessionStore {
    conn: ConnectionManager,
    prefix: String,
    ttl: Duration,
}

impl fmt::Debug for RedisMultipartSessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisMultipartSessionStore")
            .field("connection", &"ConnectionManager")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RedisMultipartSessionStore {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            ttl,
        }
    }

    fn keys(&self, session_id: &SessionId) -> (String, String) {
        let base = format!("{}:multipart:{}", self.prefix, session_id);
        (base.clone(), format!("{base}:parts"))
    }

    /// Sorted set of open uploads scored by creation time. Outlives the
    /// session keys so expired uploads can still be aborted.
    fn created_index(&self) -> String {
        format!("{}:multipart-created", self.prefix)
    }

    async fn load(
        &self,
        conn: &mut ConnectionManager,
        session_id: &SessionId,
    ) -> Result<Option<MultipartUploadState>> {
        let (state_key, parts_key) = self.keys(session_id);
        let raw: Option<String> = conn.get(&state_key).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let mut state: MultipartUploadState = serde_json::from_str(&raw)?;
        let parts: HashMap<u32, String> = conn.hgetall(&parts_key).await?;
        let mut parts: Vec<UploadedPart> = parts
            .into_iter()
            .map(|(part_number, etag)| UploadedPart { part_number, etag })
            .collect();
        parts.sort_by_key(|p| p.part_number);
        state.parts = parts;
        Ok(Some(state))
    }
}

#[async_trait]
impl MultipartSessionStore for RedisMultipartSessionStore {
    async fn insert(&self, state: MultipartUploadState) -> Result<()> {
        let (state_key, _) = self.keys(&state.session_id);
        let json = serde_json::to_string(&MultipartUploadState {
            parts: Vec::new(),
            ..state.clone()
        })?;
        let mut conn = self.conn.clone();
        let created: Option<String> = redis::cmd("SET")
            .arg(&state_key)
            .arg(json)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        if created.is_none() {
            return Err(KilnError::InvalidInput(format!(
                "multipart session {} already exists",
                state.session_id
            )));
        }
        let entry = serde_json::to_string(&ExpiredUpload::from(&state))?;
        let _: () = conn
            .zadd(self.created_index(), entry, state.created_at.timestamp())
            .await?;
        Ok(())
    }

    async fn get(&self, session_id: &SessionId) -> Result<Option<MultipartUploadState>> {
        let mut conn = self.conn.clone();
        self.load(&mut conn, session_id).await
    }

    async fn record_part(&self, session_id: &SessionId, part: UploadedPart) -> Result<()> {
        let (state_key, parts_key) = self.keys(session_id);
        let mut conn = self.conn.clone();
        let recorded: i64 = scripts::record_part()
            .key(&state_key)
            .key(&parts_key)
            .arg(part.part_number)
            .arg(&part.etag)
            .arg(self.ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        if recorded == 0 {
            return Err(KilnError::not_found("multipart session", session_id.as_str()));
        }
        Ok(())
    }

    async fn remove(&self, session_id: &SessionId) -> Result<Option<MultipartUploadState>> {
        let mut conn = self.conn.clone();
        let state = self.load(&mut conn, session_id).await?;
        let (state_key, parts_key) = self.keys(session_id);
        let _: () = conn.del(vec![state_key, parts_key]).await?;
        if let Some(state) = &state {
            let entry = serde_json::to_string(&ExpiredUpload::from(state))?;
            let _: () = conn.zrem(self.created_index(), entry).await?;
        }
        Ok(state)
    }

    async fn take_expired(&self) -> Result<Vec<ExpiredUpload>> {
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp().saturating_sub(ttl);
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn
            .zrangebyscore(self.created_index(), "-inf", cutoff)
            .await?;

        let mut expired = Vec::new();
        for entry in entries {
            // ZREM decides which instance owns the abort.
            let claimed: i64 = conn.zrem(self.created_index(), &entry).await?;
            if claimed == 0 {
                continue;
            }
            let upload: ExpiredUpload = serde_json::from_str(&entry)?;
            let (state_key, parts_key) = self.keys(&upload.session_id);
            let _: () = conn.del(vec![state_key, parts_key]).await?;
            expired.push(upload);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired multipart sessions claimed");
        }
        Ok(expired)
    }
}
