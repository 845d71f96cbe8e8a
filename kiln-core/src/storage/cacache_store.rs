use std::{fmt, path::PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{CompletedPart, ObjectRef, ObjectStore, etag_for};
use crate::error::{KilnError, Result};

/// Object store backed by a local `cacache` directory.
///
/// Final objects live under their own key. In-flight multipart uploads keep a
/// marker entry plus one entry per part under `multipart/{upload_id}/`.
#[derive(Clone)]
pub struct CacacheObjectStore {
    root: PathBuf,
}

impl fmt::Debug for CacacheObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacacheObjectStore").field(&self.root).finish()
    }
}

fn upload_prefix(upload_id: &str) -> String {
    format!("multipart/{upload_id}/")
}

fn marker_key(upload_id: &str) -> String {
    format!("multipart/{upload_id}/marker")
}

fn part_key(upload_id: &str, part_number: u32) -> String {
    format!("multipart/{upload_id}/part/{part_number:05}")
}

fn map_read_error(key: &str, err: cacache::Error) -> KilnError {
    match err {
        cacache::Error::EntryNotFound(_, _) => KilnError::not_found("object", key),
        cacache::Error::IntegrityError(err) => KilnError::ObjectStore(format!(
            "object failed integrity check: {key} ({err})"
        )),
        cacache::Error::SizeMismatch(wanted, actual) => KilnError::ObjectStore(format!(
            "object size mismatch: key={key}, wanted={wanted}, actual={actual}"
        )),
        cacache::Error::IoError(_, msg) => {
            KilnError::ObjectStore(format!("cacache read I/O error: {msg}"))
        }
        cacache::Error::SerdeError(_, msg) => {
            KilnError::ObjectStore(format!("cacache read serde error: {msg}"))
        }
    }
}

impl CacacheObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        cacache::write(&self.root, key, bytes)
            .await
            .map(|_| ())
            .map_err(|e| KilnError::ObjectStore(format!("cacache write failed: {e}")))
    }

    async fn ensure_upload(&self, upload_id: &str) -> Result<String> {
        let marker = cacache::metadata(&self.root, marker_key(upload_id))
            .await
            .map_err(|e| KilnError::ObjectStore(format!("cacache metadata failed: {e}")))?;
        let Some(_) = marker else {
            return Err(KilnError::not_found("multipart upload", upload_id));
        };
        let key = cacache::read(&self.root, marker_key(upload_id))
            .await
            .map_err(|e| map_read_error(upload_id, e))?;
        String::from_utf8(key)
            .map_err(|e| KilnError::ObjectStore(format!("corrupt upload marker: {e}")))
    }

    /// Removes every index entry that belongs to `upload_id`.
    async fn purge_upload(&self, upload_id: &str) -> Result<usize> {
        let root = self.root.clone();
        let prefix = upload_prefix(upload_id);
        let keys = tokio::task::spawn_blocking(move || {
            cacache::list_sync(&root)
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.key)
                .filter(|key| key.starts_with(&prefix))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| KilnError::Internal(format!("index scan task failed: {e}")))?;

        for key in &keys {
            cacache::remove(&self.root, key)
                .await
                .map_err(|e| KilnError::ObjectStore(format!("cacache remove failed: {e}")))?;
        }
        Ok(keys.len())
    }
}

#[async_trait]
impl ObjectStore for CacacheObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<ObjectRef> {
        self.write(key, bytes).await?;
        Ok(ObjectRef {
            key: key.to_string(),
            byte_size: bytes.len() as u64,
            etag: etag_for(bytes),
        })
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        cacache::read(&self.root, key)
            .await
            .map_err(|e| map_read_error(key, e))
    }

    async fn create_multipart(&self, key: &str) -> Result<String> {
        let upload_id = Uuid::now_v7().simple().to_string();
        self.write(&marker_key(&upload_id), key.as_bytes()).await?;
        debug!(key, upload_id, "multipart upload created");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        bytes: &[u8],
    ) -> Result<String> {
        let target = self.ensure_upload(upload_id).await?;
        if target != key {
            return Err(KilnError::InvalidInput(format!(
                "upload {upload_id} targets {target}, not {key}"
            )));
        }
        self.write(&part_key(upload_id, part_number), bytes).await?;
        Ok(etag_for(bytes))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<ObjectRef> {
        let target = self.ensure_upload(upload_id).await?;
        if target != key {
            return Err(KilnError::InvalidInput(format!(
                "upload {upload_id} targets {target}, not {key}"
            )));
        }

        let mut assembled = Vec::new();
        for part in parts {
            let bytes = self
                .get(&part_key(upload_id, part.part_number))
                .await
                .map_err(|err| match err {
                    KilnError::NotFound { .. } => KilnError::InvalidInput(format!(
                        "part {} was never uploaded",
                        part.part_number
                    )),
                    other => other,
                })?;
            if etag_for(&bytes) != part.etag {
                return Err(KilnError::InvalidInput(format!(
                    "etag mismatch for part {}",
                    part.part_number
                )));
            }
            assembled.extend_from_slice(&bytes);
        }

        let object = self.put(key, &assembled).await?;
        if let Err(err) = self.purge_upload(upload_id).await {
            warn!(upload_id, error = %err, "failed to clean up completed upload parts");
        }
        debug!(key, upload_id, parts = parts.len(), bytes = object.byte_size, "multipart upload completed");
        Ok(object)
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        let removed = self.purge_upload(upload_id).await?;
        debug!(key, upload_id, removed, "multipart upload aborted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn multipart_concatenates_in_manifest_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacacheObjectStore::new(dir.path());
        let upload = store.create_multipart("weights.bin").await.unwrap();

        let second = store
            .upload_part("weights.bin", &upload, 2, b"world")
            .await
            .unwrap();
        let first = store
            .upload_part("weights.bin", &upload, 1, b"hello ")
            .await
            .unwrap();

        let object = store
            .complete_multipart(
                "weights.bin",
                &upload,
                &[
                    CompletedPart { part_number: 1, etag: first },
                    CompletedPart { part_number: 2, etag: second },
                ],
            )
            .await
            .unwrap();
        assert_eq!(object.byte_size, 11);
        assert_eq!(store.get("weights.bin").await.unwrap(), b"hello world");

        // Parts and marker are gone once the object exists.
        assert!(matches!(
            store.upload_part("weights.bin", &upload, 3, b"!").await,
            Err(KilnError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn abort_discards_parts_and_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacacheObjectStore::new(dir.path());
        let upload = store.create_multipart("a.bin").await.unwrap();
        store.upload_part("a.bin", &upload, 1, b"x").await.unwrap();

        store.abort_multipart("a.bin", &upload).await.unwrap();
        store.abort_multipart("a.bin", &upload).await.unwrap();
        assert!(matches!(
            store.get("a.bin").await,
            Err(KilnError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn completion_rejects_wrong_etag() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacacheObjectStore::new(dir.path());
        let upload = store.create_multipart("b.bin").await.unwrap();
        store.upload_part("b.bin", &upload, 1, b"x").await.unwrap();
        let result = store
            .complete_multipart(
                "b.bin",
                &upload,
                &[CompletedPart { part_number: 1, etag: "nope".into() }],
            )
            .await;
        assert!(matches!(result, Err(KilnError::InvalidInput(_))));
    }
}
