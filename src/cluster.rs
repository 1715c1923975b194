//! Cluster coordination: membership, the global fencing lock, and the
//! per-subscription claim map.
//!
//! The lock serializes reclaim and reconciliation decisions across workers
//! and is held only across short critical sections (claim + registry update
//! + task enqueue). Claims pin one subscription to one worker and outlive
//! the lock; they are released when the owning member leaves or when the
//! breaker closes.

use crate::error::ClusterError;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::OwnedMutexGuard;

/// Identity of one worker in the cluster.
pub type MemberId = String;

/// Membership change published by the coordination backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent {
    Added(MemberId),
    Removed(MemberId),
}

/// Coordination primitives shared by every worker.
///
/// Backends: [`InProcessCluster`] for a single process, `polaris-etcd` for a
/// real cluster.
#[async_trait]
pub trait ClusterCoordinator: Send + Sync {
    /// Identity of the local member.
    fn self_id(&self) -> &str;

    /// All currently known members.
    async fn members(&self) -> Result<Vec<MemberId>, ClusterError>;

    /// Acquire the cluster-wide lock, waiting at most `timeout`.
    ///
    /// Returns `Ok(false)` when the lock could not be acquired in time or the
    /// backend is unreachable; the caller skips the round.
    async fn try_global_lock(&self, timeout: Duration) -> Result<bool, ClusterError>;

    /// Release the cluster-wide lock. A release without a held lock is a
    /// no-op.
    async fn global_unlock(&self);

    /// Atomically claim `key` for the local member. Idempotent: returns true
    /// when the local member already owns the claim.
    async fn try_claim(&self, key: &str) -> Result<bool, ClusterError>;

    /// Release the local member's claim on `key`, if any.
    async fn release_claim(&self, key: &str);

    /// Subscribe to membership changes.
    fn member_events(&self) -> broadcast::Receiver<MemberEvent>;
}

struct SharedClusterState {
    members: Mutex<BTreeSet<MemberId>>,
    claims: Mutex<HashMap<String, MemberId>>,
    lock: Arc<tokio::sync::Mutex<()>>,
    events: broadcast::Sender<MemberEvent>,
}

/// In-process coordinator: a single shared state with one handle per member.
///
/// This is the backend for single-process deployments and for tests that
/// simulate multi-worker clusters by handing several handles to the same
/// shared state.
pub struct InProcessCluster {
    self_id: MemberId,
    state: Arc<SharedClusterState>,
    held: Mutex<Option<OwnedMutexGuard<()>>>,
}

impl std::fmt::Debug for InProcessCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessCluster").field("self_id", &self.self_id).finish()
    }
}

impl InProcessCluster {
    pub fn new(self_id: impl Into<MemberId>) -> Self {
        let (events, _) = broadcast::channel(64);
        let state = Arc::new(SharedClusterState {
            members: Mutex::new(BTreeSet::new()),
            claims: Mutex::new(HashMap::new()),
            lock: Arc::new(tokio::sync::Mutex::new(())),
            events,
        });
        Self::join_state(state, self_id)
    }

    /// Create a handle for another member joining the same cluster state.
    pub fn join(&self, self_id: impl Into<MemberId>) -> Self {
        Self::join_state(Arc::clone(&self.state), self_id)
    }

    fn join_state(state: Arc<SharedClusterState>, self_id: impl Into<MemberId>) -> Self {
        let self_id = self_id.into();
        state.members.lock().expect("cluster members lock").insert(self_id.clone());
        let _ = state.events.send(MemberEvent::Added(self_id.clone()));
        Self { self_id, state, held: Mutex::new(None) }
    }

    /// Remove a member: its claims are released and a removal event is
    /// published, mirroring what a real backend does when a worker dies.
    pub fn remove_member(&self, member: &str) {
        self.state.members.lock().expect("cluster members lock").remove(member);
        let mut claims = self.state.claims.lock().expect("cluster claims lock");
        claims.retain(|_, owner| owner != member);
        drop(claims);
        tracing::info!(member, "cluster member removed, claims released");
        let _ = self.state.events.send(MemberEvent::Removed(member.to_string()));
    }

    /// Current owner of a claim, if any.
    pub fn claim_owner(&self, key: &str) -> Option<MemberId> {
        self.state.claims.lock().expect("cluster claims lock").get(key).cloned()
    }
}

#[async_trait]
impl ClusterCoordinator for InProcessCluster {
    fn self_id(&self) -> &str {
        &self.self_id
    }

    async fn members(&self) -> Result<Vec<MemberId>, ClusterError> {
        Ok(self.state.members.lock().expect("cluster members lock").iter().cloned().collect())
    }

    async fn try_global_lock(&self, timeout: Duration) -> Result<bool, ClusterError> {
        {
            let held = self.held.lock().expect("cluster held lock");
            if held.is_some() {
                return Ok(true);
            }
        }
        let lock = Arc::clone(&self.state.lock);
        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => {
                *self.held.lock().expect("cluster held lock") = Some(guard);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn global_unlock(&self) {
        self.held.lock().expect("cluster held lock").take();
    }

    async fn try_claim(&self, key: &str) -> Result<bool, ClusterError> {
        let mut claims = self.state.claims.lock().expect("cluster claims lock");
        match claims.get(key) {
            Some(owner) => Ok(owner == &self.self_id),
            None => {
                claims.insert(key.to_string(), self.self_id.clone());
                Ok(true)
            }
        }
    }

    async fn release_claim(&self, key: &str) {
        let mut claims = self.state.claims.lock().expect("cluster claims lock");
        if claims.get(key).is_some_and(|owner| owner == &self.self_id) {
            claims.remove(key);
        }
    }

    fn member_events(&self) -> broadcast::Receiver<MemberEvent> {
        self.state.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_is_exclusive_and_idempotent() {
        let a = InProcessCluster::new("pod-a");
        let b = a.join("pod-b");

        assert!(a.try_claim("sub-1").await.unwrap());
        assert!(a.try_claim("sub-1").await.unwrap(), "re-claim by owner succeeds");
        assert!(!b.try_claim("sub-1").await.unwrap(), "claim denied for other member");
    }

    #[tokio::test]
    async fn release_only_drops_own_claims() {
        let a = InProcessCluster::new("pod-a");
        let b = a.join("pod-b");

        assert!(a.try_claim("sub-1").await.unwrap());
        b.release_claim("sub-1").await;
        assert_eq!(a.claim_owner("sub-1"), Some("pod-a".to_string()));

        a.release_claim("sub-1").await;
        assert_eq!(a.claim_owner("sub-1"), None);
    }

    #[tokio::test]
    async fn removing_a_member_releases_claims_and_notifies() {
        let a = InProcessCluster::new("pod-a");
        let b = a.join("pod-b");
        let mut events = a.member_events();

        assert!(b.try_claim("sub-1").await.unwrap());
        a.remove_member("pod-b");

        assert_eq!(a.claim_owner("sub-1"), None);
        assert_eq!(a.members().await.unwrap(), vec!["pod-a".to_string()]);
        assert_eq!(events.recv().await.unwrap(), MemberEvent::Removed("pod-b".to_string()));
    }

    #[tokio::test]
    async fn global_lock_times_out_when_held_elsewhere() {
        let a = InProcessCluster::new("pod-a");
        let b = a.join("pod-b");

        assert!(a.try_global_lock(Duration::from_millis(50)).await.unwrap());
        assert!(!b.try_global_lock(Duration::from_millis(50)).await.unwrap());

        a.global_unlock().await;
        assert!(b.try_global_lock(Duration::from_millis(50)).await.unwrap());
        b.global_unlock().await;
    }

    #[tokio::test]
    async fn holding_member_can_reenter_the_lock() {
        let a = InProcessCluster::new("pod-a");
        assert!(a.try_global_lock(Duration::from_millis(10)).await.unwrap());
        assert!(a.try_global_lock(Duration::from_millis(10)).await.unwrap());
        a.global_unlock().await;
    }
}
