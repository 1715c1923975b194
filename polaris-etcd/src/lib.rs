//! etcd cluster-coordination adapter for `polaris` (companion crate).
//!
//! Maps the coordination primitives onto etcd: the global lock uses the lock
//! API, claims are create-revision transactions, and membership rides on a
//! kept-alive lease, so a member that dies takes its member key and all of
//! its claims with it. The breaker registry is a JSON-valued key range under
//! the same prefix.

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, LockOptions, PutOptions, Txn, TxnOp,
    WatchOptions,
};
use polaris::breaker::{BreakerRecord, BreakerStatus};
use polaris::cluster::{ClusterCoordinator, MemberEvent, MemberId};
use polaris::error::{ClusterError, RegistryError};
use polaris::registry::BreakerRegistry;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

/// TTL of the membership lease; claims and the lock share it.
const LEASE_TTL_SECS: i64 = 15;

#[derive(Debug, thiserror::Error)]
pub enum EtcdError {
    #[error("etcd request failed: {0}")]
    Backend(#[from] etcd_client::Error),
}

pub struct EtcdCoordinator {
    client: Client,
    self_id: MemberId,
    prefix: String,
    lease_id: i64,
    lock_key: Mutex<Option<Vec<u8>>>,
    events: broadcast::Sender<MemberEvent>,
    background: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for EtcdCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdCoordinator")
            .field("self_id", &self.self_id)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl Drop for EtcdCoordinator {
    fn drop(&mut self) {
        for task in &self.background {
            task.abort();
        }
    }
}

impl EtcdCoordinator {
    /// Connect, register the local member under a kept-alive lease, and
    /// start watching membership.
    pub async fn connect(
        endpoints: Vec<String>,
        prefix: impl Into<String>,
        self_id: impl Into<MemberId>,
    ) -> Result<Self, EtcdError> {
        let prefix = prefix.into().trim_end_matches('/').to_string();
        let self_id = self_id.into();
        let mut client = Client::connect(&endpoints, None).await?;

        let lease_id = client.lease_grant(LEASE_TTL_SECS, None).await?.id();
        let member_key = format!("{prefix}/members/{self_id}");
        client
            .put(member_key, self_id.as_str(), Some(PutOptions::new().with_lease(lease_id)))
            .await?;

        let (events, _) = broadcast::channel(64);
        let mut background = Vec::new();
        background.push(Self::spawn_keepalive(client.clone(), lease_id));
        background.push(Self::spawn_member_watch(
            client.clone(),
            format!("{prefix}/members/"),
            events.clone(),
        ));

        tracing::info!(member = %self_id, lease = lease_id, "joined cluster");
        Ok(Self {
            client,
            self_id,
            prefix,
            lease_id,
            lock_key: Mutex::new(None),
            events,
            background,
        })
    }

    fn spawn_keepalive(client: Client, lease_id: i64) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut client = client;
            loop {
                match client.lease_keep_alive(lease_id).await {
                    Ok((mut keeper, mut responses)) => loop {
                        if let Err(error) = keeper.keep_alive().await {
                            tracing::warn!(%error, "lease keep-alive send failed");
                            break;
                        }
                        match responses.message().await {
                            Ok(Some(_)) => {}
                            Ok(None) => {
                                tracing::warn!("lease keep-alive stream closed");
                                break;
                            }
                            Err(error) => {
                                tracing::warn!(%error, "lease keep-alive stream failed");
                                break;
                            }
                        }
                        tokio::time::sleep(Duration::from_secs(LEASE_TTL_SECS as u64 / 3)).await;
                    },
                    Err(error) => {
                        tracing::warn!(%error, "lease keep-alive unavailable, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    }

    fn spawn_member_watch(
        client: Client,
        members_prefix: String,
        events: broadcast::Sender<MemberEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut client = client;
            loop {
                let watch = client
                    .watch(members_prefix.as_str(), Some(WatchOptions::new().with_prefix()))
                    .await;
                let (_watcher, mut stream) = match watch {
                    Ok(pair) => pair,
                    Err(error) => {
                        tracing::warn!(%error, "member watch unavailable, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                loop {
                    match stream.message().await {
                        Ok(Some(response)) => {
                            for event in response.events() {
                                let Some(kv) = event.kv() else { continue };
                                let member = kv
                                    .key_str()
                                    .ok()
                                    .and_then(|key| key.strip_prefix(members_prefix.as_str()))
                                    .map(str::to_string);
                                let Some(member) = member else { continue };
                                let message = match event.event_type() {
                                    EventType::Put => MemberEvent::Added(member),
                                    EventType::Delete => MemberEvent::Removed(member),
                                };
                                let _ = events.send(message);
                            }
                        }
                        Ok(None) => break,
                        Err(error) => {
                            tracing::warn!(%error, "member watch stream failed");
                            break;
                        }
                    }
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        })
    }

    fn lock_name(&self) -> String {
        format!("{}/lock", self.prefix)
    }

    fn claim_key(&self, key: &str) -> String {
        format!("{}/claims/{key}", self.prefix)
    }
}

#[async_trait]
impl ClusterCoordinator for EtcdCoordinator {
    fn self_id(&self) -> &str {
        &self.self_id
    }

    async fn members(&self) -> Result<Vec<MemberId>, ClusterError> {
        let mut client = self.client.clone();
        let response = client
            .get(format!("{}/members/", self.prefix), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|error| ClusterError::Unavailable(error.to_string()))?;
        let mut members: Vec<MemberId> = response
            .kvs()
            .iter()
            .filter_map(|kv| kv.value_str().ok().map(str::to_string))
            .collect();
        members.sort();
        Ok(members)
    }

    async fn try_global_lock(&self, timeout: Duration) -> Result<bool, ClusterError> {
        let mut held = self.lock_key.lock().await;
        if held.is_some() {
            return Ok(true);
        }
        let mut client = self.client.clone();
        let options = LockOptions::new().with_lease(self.lease_id);
        match tokio::time::timeout(timeout, client.lock(self.lock_name(), Some(options))).await {
            Ok(Ok(response)) => {
                *held = Some(response.key().to_vec());
                Ok(true)
            }
            Ok(Err(error)) => {
                tracing::warn!(%error, "lock backend unreachable, skipping round");
                Ok(false)
            }
            Err(_) => Ok(false),
        }
    }

    async fn global_unlock(&self) {
        let key = self.lock_key.lock().await.take();
        if let Some(key) = key {
            let mut client = self.client.clone();
            if let Err(error) = client.unlock(key).await {
                tracing::warn!(%error, "unlock failed; the lease will reap the lock");
            }
        }
    }

    async fn try_claim(&self, key: &str) -> Result<bool, ClusterError> {
        let claim_key = self.claim_key(key);
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when([Compare::create_revision(claim_key.as_str(), CompareOp::Equal, 0)])
            .and_then([TxnOp::put(
                claim_key.as_str(),
                self.self_id.as_str(),
                Some(PutOptions::new().with_lease(self.lease_id)),
            )])
            .or_else([TxnOp::get(claim_key.as_str(), None)]);
        let response = client
            .txn(txn)
            .await
            .map_err(|error| ClusterError::Unavailable(error.to_string()))?;
        if response.succeeded() {
            return Ok(true);
        }
        // Someone holds it; it might be us from an earlier round.
        let existing = client
            .get(claim_key.as_str(), None)
            .await
            .map_err(|error| ClusterError::Unavailable(error.to_string()))?;
        Ok(existing
            .kvs()
            .first()
            .and_then(|kv| kv.value_str().ok())
            .is_some_and(|owner| owner == self.self_id))
    }

    async fn release_claim(&self, key: &str) {
        let claim_key = self.claim_key(key);
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when([Compare::value(
                claim_key.as_str(),
                CompareOp::Equal,
                self.self_id.as_str(),
            )])
            .and_then([TxnOp::delete(claim_key.as_str(), None)]);
        if let Err(error) = client.txn(txn).await {
            tracing::warn!(key, %error, "claim release failed; the lease will reap it");
        }
    }

    fn member_events(&self) -> broadcast::Receiver<MemberEvent> {
        self.events.subscribe()
    }
}

/// Breaker registry stored as JSON values under `{prefix}/breakers/`.
///
/// etcd returns ranges sorted by key, which gives the stable
/// subscription-id paging the registry contract asks for. Status and owner
/// filters are applied on the client.
pub struct EtcdBreakerRegistry {
    client: Client,
    prefix: String,
}

impl std::fmt::Debug for EtcdBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdBreakerRegistry").field("prefix", &self.prefix).finish()
    }
}

impl EtcdBreakerRegistry {
    pub fn new(client: Client, prefix: impl Into<String>) -> Self {
        Self { client, prefix: prefix.into().trim_end_matches('/').to_string() }
    }

    fn record_key(&self, subscription_id: &str) -> String {
        format!("{}/breakers/{subscription_id}", self.prefix)
    }
}

#[async_trait]
impl BreakerRegistry for EtcdBreakerRegistry {
    async fn get(&self, subscription_id: &str) -> Result<Option<BreakerRecord>, RegistryError> {
        let mut client = self.client.clone();
        let response = client
            .get(self.record_key(subscription_id), None)
            .await
            .map_err(|error| RegistryError::Unavailable(error.to_string()))?;
        let Some(kv) = response.kvs().first() else {
            return Ok(None);
        };
        serde_json::from_slice(kv.value())
            .map(Some)
            .map_err(|error| RegistryError::Unavailable(format!("corrupt record: {error}")))
    }

    async fn get_paged(
        &self,
        page: usize,
        size: usize,
        status: Option<BreakerStatus>,
        owner: Option<&str>,
    ) -> Result<Vec<BreakerRecord>, RegistryError> {
        let mut client = self.client.clone();
        let response = client
            .get(format!("{}/breakers/", self.prefix), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|error| RegistryError::Unavailable(error.to_string()))?;
        let records = response
            .kvs()
            .iter()
            .filter_map(|kv| serde_json::from_slice::<BreakerRecord>(kv.value()).ok())
            .filter(|record| status.is_none_or(|s| record.status == s))
            .filter(|record| owner.is_none_or(|o| record.assigned_owner.as_deref() == Some(o)))
            .skip(page.saturating_mul(size))
            .take(size)
            .collect();
        Ok(records)
    }

    async fn update(&self, record: BreakerRecord) -> Result<(), RegistryError> {
        let value = serde_json::to_vec(&record)
            .map_err(|error| RegistryError::Unavailable(error.to_string()))?;
        let mut client = self.client.clone();
        client
            .put(self.record_key(&record.subscription_id), value, None)
            .await
            .map(|_| ())
            .map_err(|error| RegistryError::Unavailable(error.to_string()))
    }

    async fn update_status(
        &self,
        subscription_id: &str,
        status: BreakerStatus,
    ) -> Result<(), RegistryError> {
        if let Some(mut record) = self.get(subscription_id).await? {
            record.status = status;
            self.update(record).await?;
        }
        Ok(())
    }

    async fn remove(&self, subscription_id: &str) -> Result<(), RegistryError> {
        let mut client = self.client.clone();
        client
            .delete(self.record_key(subscription_id), None)
            .await
            .map(|_| ())
            .map_err(|error| RegistryError::Unavailable(error.to_string()))
    }
}
