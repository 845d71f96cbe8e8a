use std::{
    collections::hash_map::DefaultHasher,
    fmt,
    hash::{Hash, Hasher},
};

use tokio::sync::{Mutex, MutexGuard};

use crate::types::JobId;

const DEFAULT_STRIPES: usize = 64;

/// Fixed set of async mutexes keyed by job id hash. Writes to one job are
/// serialised so that publish order matches apply order; unrelated jobs
/// rarely contend.
pub struct StripedLocks {
    stripes: Vec<Mutex<()>>,
}

impl fmt::Debug for StripedLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StripedLocks")
            .field("stripes", &self.stripes.len())
            .finish()
    }
}

impl Default for StripedLocks {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}

impl StripedLocks {
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    fn index(&self, job_id: &JobId) -> usize {
        let mut hasher = DefaultHasher::new();
        job_id.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    pub async fn lock(&self, job_id: &JobId) -> MutexGuard<'_, ()> {
        self.stripes[self.index(job_id)].lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_job_maps_to_same_stripe() {
        let locks = StripedLocks::new(8);
        let id = JobId::parse("job-42").unwrap();
        assert_eq!(locks.index(&id), locks.index(&id.clone()));
        assert!(locks.index(&id) < 8);
    }

    #[tokio::test]
    async fn second_writer_waits_for_first() {
        let locks = StripedLocks::new(1);
        let id = JobId::parse("job-1").unwrap();
        let guard = locks.lock(&id).await;
        assert!(locks.stripes[0].try_lock().is_err());
        drop(guard);
        assert!(locks.stripes[0].try_lock().is_ok());
    }
}
