// SPDX-License-Identifier: MIT OR Apache-2.0
//! Synchronous broker-side authorization decisions.
//!
//! The external broker calls in on every client connect (`user`) and on
//! every publish or subscribe (`acl`). Decisions must come back in
//! single-digit milliseconds at target load, so ACL sets are served from a
//! sharded in-process cache with a short TTL and explicit invalidation
//! driven by platform events.
//!
//! This is the one component that converts *every* internal failure into
//! a single outward answer: deny. A decision also carries its own short
//! deadline; expiry denies.
//!
//! Cache mutations flow through a single-writer channel, so the read path
//! never takes a write lock it could contend on.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use fbp_bus::EventSubscription;
use fbp_core::{AccessOp, MqttAcl, PlatformEvent, device_username, topic::topic_matches};
use fbp_error::FleetResult;
use fbp_store::Store;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Number of cache shards.
const SHARDS: usize = 16;

/// Capacity of the single-writer mutation channel.
const WRITER_QUEUE: usize = 1_024;

/// The outward answer. Nothing else ever leaves this service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Allow the connect / publish / subscribe.
    Allow,
    /// Refuse it (also the shape of every internal failure).
    Deny,
}

impl Decision {
    /// Returns `true` for [`Decision::Allow`].
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Snapshot of ACL-cache health, surfaced by the daemon health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Cached ACL sets across all shards (expired entries included until
    /// their next lookup or invalidation).
    pub entries: usize,
    /// Number of shards.
    pub shards: usize,
}

#[derive(Clone)]
struct CacheEntry {
    acls: Arc<Vec<MqttAcl>>,
    expires_at: Instant,
}

enum Mutation {
    Insert(String, CacheEntry),
    Remove(String),
}

struct AclCache {
    shards: Vec<RwLock<HashMap<String, CacheEntry>>>,
}

impl AclCache {
    fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, username: &str) -> &RwLock<HashMap<String, CacheEntry>> {
        let mut hasher = DefaultHasher::new();
        username.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    fn get(&self, username: &str, now: Instant) -> Option<Arc<Vec<MqttAcl>>> {
        let shard = self
            .shard(username)
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        shard
            .get(username)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| Arc::clone(&entry.acls))
    }

    fn apply(&self, mutation: Mutation) {
        match mutation {
            Mutation::Insert(username, entry) => {
                let mut shard = self
                    .shard(&username)
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                shard.insert(username, entry);
            }
            Mutation::Remove(username) => {
                let mut shard = self
                    .shard(&username)
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                shard.remove(&username);
            }
        }
    }
}

/// The decision service.
pub struct BrokerAuthService {
    store: Store,
    cache: Arc<AclCache>,
    cache_ttl: Duration,
    deadline: Duration,
    writer: mpsc::Sender<Mutation>,
}

impl BrokerAuthService {
    /// Create the service and spawn its cache-writer task.
    pub fn new(store: Store, cache_ttl: Duration, deadline: Duration) -> Arc<Self> {
        let cache = Arc::new(AclCache::new());
        let (writer, mut mutations) = mpsc::channel::<Mutation>(WRITER_QUEUE);

        let writer_cache = Arc::clone(&cache);
        tokio::spawn(async move {
            while let Some(mutation) = mutations.recv().await {
                writer_cache.apply(mutation);
            }
        });

        Arc::new(Self {
            store,
            cache,
            cache_ttl,
            deadline,
            writer,
        })
    }

    // -- decisions ------------------------------------------------------------

    /// Decide a `user` (connect) request.
    pub async fn check_user(&self, username: &str, password: &str) -> Decision {
        if username.is_empty() || password.is_empty() {
            return Decision::Deny;
        }
        let work = self.user_allowed(username.to_string(), password.to_string());
        match tokio::time::timeout(self.deadline, work).await {
            Ok(Ok(true)) => Decision::Allow,
            Ok(Ok(false)) => Decision::Deny,
            Ok(Err(err)) => {
                warn!(username, error = %err, "user check failed internally; denying");
                Decision::Deny
            }
            Err(_) => {
                warn!(username, "user check deadline elapsed; denying");
                Decision::Deny
            }
        }
    }

    /// Decide an `acl` (publish/subscribe) request.
    pub async fn check_acl(&self, username: &str, topic: &str, op: AccessOp) -> Decision {
        if username.is_empty() || topic.is_empty() {
            return Decision::Deny;
        }
        let work = self.acl_allows(username.to_string(), topic.to_string(), op);
        match tokio::time::timeout(self.deadline, work).await {
            Ok(Ok(true)) => Decision::Allow,
            Ok(Ok(false)) => Decision::Deny,
            Ok(Err(err)) => {
                warn!(username, topic, error = %err, "acl check failed internally; denying");
                Decision::Deny
            }
            Err(_) => {
                warn!(username, topic, "acl check deadline elapsed; denying");
                Decision::Deny
            }
        }
    }

    async fn user_allowed(&self, username: String, password: String) -> FleetResult<bool> {
        let Some(user) = self.store.get_mqtt_user(&username).await? else {
            return Ok(false);
        };
        if !user.active {
            return Ok(false);
        }
        // Argon2 verification costs tens of milliseconds; keep it off the
        // async workers.
        let verified =
            tokio::task::spawn_blocking(move || fbp_crypto::verify_password(&password, &user.password_hash))
                .await
                .unwrap_or(false);
        Ok(verified)
    }

    async fn acl_allows(&self, username: String, topic: String, op: AccessOp) -> FleetResult<bool> {
        let acls = match self.cache.get(&username, Instant::now()) {
            Some(cached) => cached,
            None => {
                let fetched = Arc::new(self.store.list_acls(&username).await?);
                // Mutations go through the single writer; a full queue just
                // means this lookup stays uncached.
                let entry = CacheEntry {
                    acls: Arc::clone(&fetched),
                    expires_at: Instant::now() + self.cache_ttl,
                };
                if self
                    .writer
                    .try_send(Mutation::Insert(username.clone(), entry))
                    .is_err()
                {
                    debug!(username, "cache writer queue full; entry not cached");
                }
                fetched
            }
        };

        Ok(acls
            .iter()
            .any(|acl| acl.permissions.allows(op) && topic_matches(&acl.topic_pattern, &topic)))
    }

    /// Snapshot of the ACL cache for health reporting.
    pub fn cache_stats(&self) -> CacheStats {
        let entries = self
            .cache
            .shards
            .iter()
            .map(|shard| {
                shard
                    .read()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .len()
            })
            .sum();
        CacheStats {
            entries,
            shards: SHARDS,
        }
    }

    // -- invalidation ---------------------------------------------------------

    /// Drop one account's cached ACL set.
    pub fn invalidate(&self, username: &str) {
        if self
            .writer
            .try_send(Mutation::Remove(username.to_string()))
            .is_err()
        {
            warn!(username, "cache writer queue full; invalidation dropped");
        }
    }

    /// Listen for platform events that obsolete cached ACLs. Runs until
    /// the bus closes.
    pub async fn run_invalidation(self: Arc<Self>, mut events: EventSubscription) {
        while let Some(event) = events.recv().await {
            match event {
                PlatformEvent::DeviceProvisioned { device_id }
                | PlatformEvent::DeviceRetired { device_id } => {
                    self.invalidate(&device_username(&device_id));
                }
                PlatformEvent::AclChanged { username } => self.invalidate(&username),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fbp_bus::EventBus;
    use fbp_core::MqttUser;
    use fbp_core::topic::device_acl_set;

    const TTL: Duration = Duration::from_secs(5);
    const DEADLINE: Duration = Duration::from_secs(5);

    async fn setup() -> (Arc<BrokerAuthService>, Store, Arc<EventBus>, String) {
        let bus = Arc::new(EventBus::new());
        let store = Store::in_memory(Arc::clone(&bus)).await.unwrap();

        let password = fbp_crypto::generate_secret();
        let user = MqttUser {
            username: "device-D1".into(),
            password_hash: fbp_crypto::hash_password(&password).unwrap(),
            active: true,
            created_at: Utc::now(),
        };
        let mut tx = store.begin_device("D1").await.unwrap();
        tx.replace_mqtt_account(&user, &device_acl_set("D1")).await.unwrap();
        tx.commit().await.unwrap();

        let service = BrokerAuthService::new(store.clone(), TTL, DEADLINE);
        (service, store, bus, password)
    }

    #[tokio::test]
    async fn valid_credentials_allowed() {
        let (service, _store, _bus, password) = setup().await;
        assert_eq!(service.check_user("device-D1", &password).await, Decision::Allow);
    }

    #[tokio::test]
    async fn wrong_password_denied() {
        let (service, _store, _bus, _password) = setup().await;
        assert_eq!(service.check_user("device-D1", "wrong").await, Decision::Deny);
    }

    #[tokio::test]
    async fn unknown_or_empty_user_denied() {
        let (service, _store, _bus, password) = setup().await;
        assert_eq!(service.check_user("device-D9", &password).await, Decision::Deny);
        assert_eq!(service.check_user("", &password).await, Decision::Deny);
        assert_eq!(service.check_user("device-D1", "").await, Decision::Deny);
    }

    #[tokio::test]
    async fn inactive_user_denied() {
        let (service, store, _bus, password) = setup().await;
        let mut user = store.get_mqtt_user("device-D1").await.unwrap().unwrap();
        user.active = false;
        let mut tx = store.begin_device("D1").await.unwrap();
        tx.replace_mqtt_account(&user, &device_acl_set("D1")).await.unwrap();
        tx.commit().await.unwrap();
        service.invalidate("device-D1");

        assert_eq!(service.check_user("device-D1", &password).await, Decision::Deny);
    }

    #[tokio::test]
    async fn acl_covers_own_namespace_only() {
        let (service, _store, _bus, _password) = setup().await;

        for (topic, op, expect) in [
            ("agent/D1/cmd", AccessOp::Read, Decision::Allow),
            ("agent/D1/jobs/42/status", AccessOp::Write, Decision::Allow),
            ("state/D1/current", AccessOp::Read, Decision::Allow),
            ("sensor/D1/temp", AccessOp::Write, Decision::Allow),
            // Write-only telemetry: reads denied.
            ("sensor/D1/temp", AccessOp::Read, Decision::Deny),
            // Foreign namespaces: denied in both directions.
            ("sensor/D2/temp", AccessOp::Write, Decision::Deny),
            ("agent/D2/cmd", AccessOp::Read, Decision::Deny),
        ] {
            assert_eq!(
                service.check_acl("device-D1", topic, op).await,
                expect,
                "topic {topic} op {op:?}"
            );
        }
    }

    #[tokio::test]
    async fn unknown_account_has_no_acls() {
        let (service, _store, _bus, _password) = setup().await;
        assert_eq!(
            service.check_acl("device-D9", "agent/D9/cmd", AccessOp::Read).await,
            Decision::Deny
        );
    }

    #[tokio::test]
    async fn provisioning_event_invalidates_cache() {
        let (service, store, bus, _password) = setup().await;
        let listener = tokio::spawn(Arc::clone(&service).run_invalidation(bus.subscribe()));

        // Warm the cache.
        assert!(service
            .check_acl("device-D1", "agent/D1/cmd", AccessOp::Read)
            .await
            .is_allowed());

        // Retire the account behind the cache's back, then publish the event.
        let mut tx = store.begin_device("D1").await.unwrap();
        tx.delete_mqtt_account("device-D1").await.unwrap();
        tx.commit().await.unwrap();
        bus.publish(PlatformEvent::DeviceRetired {
            device_id: "D1".into(),
        });

        // Give the listener and writer a moment to drain.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            service.check_acl("device-D1", "agent/D1/cmd", AccessOp::Read).await,
            Decision::Deny
        );
        listener.abort();
    }

    #[tokio::test]
    async fn cache_stats_reflect_warm_entries() {
        let (service, _store, _bus, _password) = setup().await;
        assert_eq!(service.cache_stats().entries, 0);

        service
            .check_acl("device-D1", "agent/D1/cmd", AccessOp::Read)
            .await;
        // The insert travels through the single-writer channel.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = service.cache_stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.shards, 16);
    }

    #[tokio::test]
    async fn internal_failure_denies() {
        let (service, store, _bus, password) = setup().await;
        store.pool_close().await;
        assert_eq!(service.check_user("device-D1", &password).await, Decision::Deny);
        assert_eq!(
            service.check_acl("device-D1", "agent/D1/cmd", AccessOp::Read).await,
            Decision::Deny
        );
    }
}
