use std::{
    fmt,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::UploadTarget;
use crate::{
    error::{KilnError, Result},
    types::SessionId,
};

#[derive(Clone, Debug)]
pub struct ChunkSubmission {
    pub session_id: SessionId,
    pub index: u32,
    pub total_chunks: u32,
    pub bytes: Vec<u8>,
    pub metadata: Value,
}

/// A chunk session whose every index has arrived, concatenated in order.
#[derive(Clone, PartialEq)]
pub struct ReassembledUpload {
    pub session_id: SessionId,
    pub total_chunks: u32,
    pub metadata: Value,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for ReassembledUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReassembledUpload")
            .field("session_id", &self.session_id)
            .field("total_chunks", &self.total_chunks)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkStoreOutcome {
    Pending { received: u32, total: u32 },
    /// This call stored the final chunk. The session is gone from the store
    /// and exactly one caller ever sees this.
    Complete(ReassembledUpload),
    /// The session was already reassembled; the chunk is a late duplicate.
    AlreadyConsumed { total: u32 },
}

/// Session state for client-chunked uploads.
#[async_trait]
pub trait ChunkSessionStore: Send + Sync + fmt::Debug {
    /// Stores one chunk. Completion detection and session removal happen in
    /// the same atomic step.
    async fn store_chunk(&self, submission: ChunkSubmission) -> Result<ChunkStoreOutcome>;

    /// `(received, total)` for an open session.
    async fn progress(&self, session_id: &SessionId) -> Result<Option<(u32, u32)>>;
}

pub(crate) fn validate_chunk(submission: &ChunkSubmission, max_total: u32) -> Result<()> {
    if submission.total_chunks == 0 {
        return Err(KilnError::InvalidInput("totalChunks must be positive".into()));
    }
    if submission.total_chunks > max_total {
        return Err(KilnError::InvalidInput(format!(
            "totalChunks {} exceeds the limit of {max_total}",
            submission.total_chunks
        )));
    }
    if submission.index >= submission.total_chunks {
        return Err(KilnError::InvalidInput(format!(
            "chunkIndex {} is outside 0..{}",
            submission.index, submission.total_chunks
        )));
    }
    Ok(())
}

fn total_mismatch(session_id: &SessionId, stored: usize, given: u32) -> KilnError {
    KilnError::InvalidInput(format!(
        "session {session_id} was opened with {stored} chunks, not {given}"
    ))
}

struct OpenChunkSession {
    chunks: Vec<Option<Vec<u8>>>,
    received: u32,
    metadata: Value,
    opened_at: Instant,
}

impl OpenChunkSession {
    fn new(total: u32, metadata: Value) -> Self {
        Self {
            chunks: vec![None; total as usize],
            received: 0,
            metadata,
            opened_at: Instant::now(),
        }
    }

    fn total(&self) -> u32 {
        self.chunks.len() as u32
    }

    fn put(&mut self, index: u32, bytes: Vec<u8>) {
        let slot = &mut self.chunks[index as usize];
        if slot.is_none() {
            self.received += 1;
        }
        *slot = Some(bytes);
    }

    fn assemble(self, session_id: SessionId) -> ReassembledUpload {
        let total_chunks = self.total();
        let bytes = self.chunks.into_iter().flatten().flatten().collect();
        ReassembledUpload {
            session_id,
            total_chunks,
            metadata: self.metadata,
            bytes,
        }
    }
}

/// Single-process chunk store. Consumed session ids are remembered for a
/// while so late duplicates do not open a fresh session.
pub struct InMemoryChunkSessionStore {
    sessions: DashMap<SessionId, OpenChunkSession>,
    consumed: DashMap<SessionId, (Instant, u32)>,
    session_ttl: Duration,
    tombstone_ttl: Duration,
}

impl fmt::Debug for InMemoryChunkSessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryChunkSessionStore")
            .field("open_sessions", &self.sessions.len())
            .field("tombstones", &self.consumed.len())
            .finish()
    }
}

impl Default for InMemoryChunkSessionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60), Duration::from_secs(60 * 60))
    }
}

impl InMemoryChunkSessionStore {
    pub fn new(session_ttl: Duration, tombstone_ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            consumed: DashMap::new(),
            session_ttl,
            tombstone_ttl,
        }
    }

    fn prune(&self) {
        let now = Instant::now();
        self.sessions
            .retain(|_, session| now.duration_since(session.opened_at) < self.session_ttl);
        self.consumed
            .retain(|_, (at, _)| now.duration_since(*at) < self.tombstone_ttl);
    }
}

#[async_trait]
impl ChunkSessionStore for InMemoryChunkSessionStore {
    async fn store_chunk(&self, submission: ChunkSubmission) -> Result<ChunkStoreOutcome> {
        validate_chunk(&submission, u32::MAX)?;
        self.prune();
        let ChunkSubmission {
            session_id,
            index,
            total_chunks,
            bytes,
            metadata,
        } = submission;

        // Lock order is always sessions shard, then tombstones.
        match self.sessions.entry(session_id.clone()) {
            Entry::Occupied(mut entry) => {
                let session = entry.get_mut();
                if session.total() != total_chunks {
                    return Err(total_mismatch(
                        &session_id,
                        session.chunks.len(),
                        total_chunks,
                    ));
                }
                session.put(index, bytes);
                if session.received < total_chunks {
                    return Ok(ChunkStoreOutcome::Pending {
                        received: session.received,
                        total: total_chunks,
                    });
                }
                self.consumed
                    .insert(session_id.clone(), (Instant::now(), total_chunks));
                let session = entry.remove();
                debug!(session = %session_id, total_chunks, "chunk session complete");
                Ok(ChunkStoreOutcome::Complete(session.assemble(session_id)))
            }
            Entry::Vacant(entry) => {
                if let Some(tombstone) = self.consumed.get(&session_id) {
                    return Ok(ChunkStoreOutcome::AlreadyConsumed { total: tombstone.1 });
                }
                let mut session = OpenChunkSession::new(total_chunks, metadata);
                session.put(index, bytes);
                if total_chunks == 1 {
                    self.consumed
                        .insert(session_id.clone(), (Instant::now(), total_chunks));
                    return Ok(ChunkStoreOutcome::Complete(session.assemble(session_id)));
                }
                entry.insert(session);
                Ok(ChunkStoreOutcome::Pending {
                    received: 1,
                    total: total_chunks,
                })
            }
        }
    }

    async fn progress(&self, session_id: &SessionId) -> Result<Option<(u32, u32)>> {
        Ok(self
            .sessions
            .get(session_id)
            .map(|session| (session.received, session.total())))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Server-side record of an in-flight multipart upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartUploadState {
    pub session_id: SessionId,
    pub upload_id: String,
    pub object_key: String,
    pub target: UploadTarget,
    /// Last write wins per part number.
    pub parts: Vec<UploadedPart>,
    pub created_at: DateTime<Utc>,
}

/// Remote upload left behind by a session that outlived its TTL.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiredUpload {
    pub session_id: SessionId,
    pub object_key: String,
    pub upload_id: String,
}

impl From<&MultipartUploadState> for ExpiredUpload {
    fn from(state: &MultipartUploadState) -> Self {
        Self {
            session_id: state.session_id.clone(),
            object_key: state.object_key.clone(),
            upload_id: state.upload_id.clone(),
        }
    }
}

#[async_trait]
pub trait MultipartSessionStore: Send + Sync + fmt::Debug {
    /// Fails with `InvalidInput` when the session id is taken.
    async fn insert(&self, state: MultipartUploadState) -> Result<()>;

    async fn get(&self, session_id: &SessionId) -> Result<Option<MultipartUploadState>>;

    /// Fails with `NotFound` when the session does not exist.
    async fn record_part(&self, session_id: &SessionId, part: UploadedPart) -> Result<()>;

    async fn remove(&self, session_id: &SessionId) -> Result<Option<MultipartUploadState>>;

    /// Drops every session created longer than the TTL ago. Each expired
    /// session is handed out once so its remote upload can be aborted.
    async fn take_expired(&self) -> Result<Vec<ExpiredUpload>>;
}

pub(crate) fn upsert_part(parts: &mut Vec<UploadedPart>, part: UploadedPart) {
    match parts.iter_mut().find(|p| p.part_number == part.part_number) {
        Some(existing) => existing.etag = part.etag,
        None => parts.push(part),
    }
}

#[derive(Debug)]
pub struct InMemoryMultipartSessionStore {
    sessions: DashMap<SessionId, MultipartUploadState>,
    session_ttl: Duration,
}

impl Default for InMemoryMultipartSessionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60))
    }
}

impl InMemoryMultipartSessionStore {
    pub fn new(session_ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            session_ttl,
        }
    }

    fn is_expired(&self, state: &MultipartUploadState, now: DateTime<Utc>) -> bool {
        (now - state.created_at)
            .to_std()
            .is_ok_and(|age| age >= self.session_ttl)
    }
}

#[async_trait]
impl MultipartSessionStore for InMemoryMultipartSessionStore {
    async fn insert(&self, state: MultipartUploadState) -> Result<()> {
        match self.sessions.entry(state.session_id.clone()) {
            Entry::Occupied(_) => Err(KilnError::InvalidInput(format!(
                "multipart session {} already exists",
                state.session_id
            ))),
            Entry::Vacant(entry) => {
                entry.insert(state);
                Ok(())
            }
        }
    }

    async fn get(&self, session_id: &SessionId) -> Result<Option<MultipartUploadState>> {
        Ok(self.sessions.get(session_id).map(|state| state.clone()))
    }

    async fn record_part(&self, session_id: &SessionId, part: UploadedPart) -> Result<()> {
        let mut state = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| KilnError::not_found("multipart session", session_id.as_str()))?;
        upsert_part(&mut state.parts, part);
        Ok(())
    }

    async fn remove(&self, session_id: &SessionId) -> Result<Option<MultipartUploadState>> {
        Ok(self.sessions.remove(session_id).map(|(_, state)| state))
    }

    async fn take_expired(&self) -> Result<Vec<ExpiredUpload>> {
        let now = Utc::now();
        // Collect first; removing while iterating would deadlock on the shard.
        let candidates: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| self.is_expired(entry.value(), now))
            .map(|entry| entry.key().clone())
            .collect();
        Ok(candidates
            .into_iter()
            .filter_map(|id| {
                self.sessions
                    .remove_if(&id, |_, state| self.is_expired(state, now))
                    .map(|(_, state)| ExpiredUpload::from(&state))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    fn chunk(index: u32, total: u32, bytes: &[u8]) -> ChunkSubmission {
        ChunkSubmission {
            session_id: SessionId::parse("s1").unwrap(),
            index,
            total_chunks: total,
            bytes: bytes.to_vec(),
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn completes_exactly_once_regardless_of_order() {
        let store = InMemoryChunkSessionStore::default();
        let parts: [&[u8]; 5] = [b"a", b"b", b"c", b"d", b"e"];
        let mut outcomes = Vec::new();
        for index in [2u32, 0, 4, 1, 3] {
            outcomes.push(
                store
                    .store_chunk(chunk(index, 5, parts[index as usize]))
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(
            outcomes[3],
            ChunkStoreOutcome::Pending { received: 4, total: 5 }
        );
        let ChunkStoreOutcome::Complete(upload) = &outcomes[4] else {
            panic!("last chunk should complete the session");
        };
        assert_eq!(upload.bytes, b"abcde");

        let late = store.store_chunk(chunk(1, 5, b"b")).await.unwrap();
        assert_eq!(late, ChunkStoreOutcome::AlreadyConsumed { total: 5 });
        assert_eq!(store.progress(&SessionId::parse("s1").unwrap()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_chunk_does_not_count_twice() {
        let store = InMemoryChunkSessionStore::default();
        store.store_chunk(chunk(0, 3, b"x")).await.unwrap();
        let again = store.store_chunk(chunk(0, 3, b"y")).await.unwrap();
        assert_eq!(again, ChunkStoreOutcome::Pending { received: 1, total: 3 });
    }

    #[tokio::test]
    async fn changing_total_is_rejected() {
        let store = InMemoryChunkSessionStore::default();
        store.store_chunk(chunk(0, 3, b"x")).await.unwrap();
        assert!(matches!(
            store.store_chunk(chunk(1, 4, b"y")).await,
            Err(KilnError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn racing_final_chunks_complete_once() {
        let store = Arc::new(InMemoryChunkSessionStore::default());
        store.store_chunk(chunk(0, 2, b"a")).await.unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.store_chunk(chunk(1, 2, b"b")).await.unwrap()
            }));
        }
        let mut completes = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), ChunkStoreOutcome::Complete(_)) {
                completes += 1;
            }
        }
        assert_eq!(completes, 1);
    }

    #[test]
    fn chunk_validation_bounds() {
        assert!(validate_chunk(&chunk(0, 0, b""), 10).is_err());
        assert!(validate_chunk(&chunk(3, 3, b""), 10).is_err());
        assert!(validate_chunk(&chunk(0, 11, b""), 10).is_err());
        assert!(validate_chunk(&chunk(2, 3, b""), 10).is_ok());
    }

    #[test]
    fn parts_are_last_write_wins() {
        let mut parts = Vec::new();
        upsert_part(&mut parts, UploadedPart { part_number: 1, etag: "a".into() });
        upsert_part(&mut parts, UploadedPart { part_number: 1, etag: "b".into() });
        assert_eq!(parts, vec![UploadedPart { part_number: 1, etag: "b".into() }]);
    }

    #[tokio::test]
    async fn multipart_sessions_expire_after_ttl() {
        let store = InMemoryMultipartSessionStore::new(Duration::from_secs(60));
        let state = |id: &str, age_secs: i64| MultipartUploadState {
            session_id: SessionId::parse(id).unwrap(),
            upload_id: format!("upload-{id}"),
            object_key: format!("uploads/o1/j1/{id}.bin"),
            target: UploadTarget {
                job_id: crate::types::JobId::parse("j1").unwrap(),
                owner_id: crate::types::OwnerId::parse("o1").unwrap(),
                descriptor: crate::types::FileDescriptor::output("weights.bin"),
            },
            parts: Vec::new(),
            created_at: Utc::now() - chrono::Duration::seconds(age_secs),
        };
        store.insert(state("old", 120)).await.unwrap();
        store.insert(state("fresh", 0)).await.unwrap();

        let expired = store.take_expired().await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].upload_id, "upload-old");
        assert!(store.take_expired().await.unwrap().is_empty());

        let old = SessionId::parse("old").unwrap();
        assert_eq!(store.get(&old).await.unwrap(), None);
        assert!(store.get(&SessionId::parse("fresh").unwrap()).await.unwrap().is_some());
    }

    proptest::proptest! {
        #[test]
        fn any_arrival_order_reassembles_in_index_order(
            order in proptest::strategy::Strategy::prop_shuffle(
                proptest::strategy::Just((0u32..7).collect::<Vec<_>>())
            )
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let completed = runtime.block_on(async {
                let store = InMemoryChunkSessionStore::default();
                let mut completed = Vec::new();
                for index in order {
                    let outcome = store
                        .store_chunk(chunk(index, 7, &[b'a' + index as u8]))
                        .await
                        .unwrap();
                    if let ChunkStoreOutcome::Complete(upload) = outcome {
                        completed.push(upload.bytes);
                    }
                }
                completed
            });
            proptest::prop_assert_eq!(completed, vec![b"abcdefg".to_vec()]);
        }
    }
}
