//! Local job claims
//!
//! A worker processes each job at most once at a time. The claim is held by a
//! guard owned by the dispatch task and released when the task ends, however
//! it ends.

use botfleet_core::model::JobId;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

/// Jobs currently being dispatched by this process
#[derive(Debug, Default)]
pub struct ClaimSet {
    claimed: Mutex<HashSet<JobId>>,
}

impl ClaimSet {
    /// Create an empty claim set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id`. Returns `None` if it is already claimed.
    #[must_use]
    pub fn try_claim(self: &Arc<Self>, id: &JobId) -> Option<ClaimGuard> {
        let mut claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);
        if !claimed.insert(id.clone()) {
            return None;
        }
        Some(ClaimGuard {
            claims: Arc::clone(self),
            id: id.clone(),
        })
    }

    /// Number of claimed jobs
    pub(crate) fn len(&self) -> usize {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Releases its claim on drop
#[derive(Debug)]
pub struct ClaimGuard {
    claims: Arc<ClaimSet>,
    id: JobId,
}

impl ClaimGuard {
    /// Claimed job
    #[must_use]
    pub const fn job_id(&self) -> &JobId {
        &self.id
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.claims
            .claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_claim_is_refused_until_release() {
        let claims = Arc::new(ClaimSet::new());
        let id = JobId::from("j1");

        let guard = claims.try_claim(&id);
        assert!(guard.is_some());
        assert!(claims.try_claim(&id).is_none());
        assert_eq!(claims.len(), 1);

        drop(guard);
        assert_eq!(claims.len(), 0);
        assert!(claims.try_claim(&id).is_some());
    }

    #[tokio::test]
    async fn test_claim_released_when_task_panics() {
        let claims = Arc::new(ClaimSet::new());
        let id = JobId::from("j1");
        let guard = claims.try_claim(&id);

        let handle = tokio::spawn(async move {
            let _guard = guard;
            panic!("dispatch task failed");
        });
        assert!(handle.await.is_err());
        assert_eq!(claims.len(), 0);
        assert!(claims.try_claim(&id).is_some());
    }
}
