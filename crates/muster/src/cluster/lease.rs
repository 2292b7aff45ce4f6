//! Exclusive Lease Lock used to elect a single bootstrapper.
//!
//! Exclusivity is enforced by the backing [`LeaseStore`], never by
//! read-then-write logic in this process. Races surface as named outcomes
//! ([`CreateOutcome`], [`AcquireOutcome`]) rather than errors. Every store
//! call is bounded so a hung store surfaces as [`ClusterError::LockUnavailable`].

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use muster_common::ClusterError;
use muster_common::constants::lock::DEFAULT_CALL_TIMEOUT_MS;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Result of creating the lock resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Result of a lease attempt
#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    Acquired(LeaseHandle),
    /// Another instance holds a live lease; not a fault
    AlreadyHeld,
}

/// Conditional-write store arbitrating the bootstrap lease
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create-if-absent of the lock resource
    async fn create_if_absent(&self, resource: &str) -> Result<CreateOutcome, ClusterError>;

    /// Take the lease with `token` for `duration`.
    ///
    /// Returns `Ok(false)` while another token holds a live lease.
    async fn acquire(&self, resource: &str, token: &str, duration: Duration) -> Result<bool, ClusterError>;

    /// Extend the lease held by `token`; `Ok(false)` if it is no longer ours
    async fn renew(&self, resource: &str, token: &str, duration: Duration) -> Result<bool, ClusterError>;

    /// Drop the lease held by `token`; `Ok(false)` if it was not held
    async fn release(&self, resource: &str, token: &str) -> Result<bool, ClusterError>;
}

/// A held lease: opaque token plus expiry
#[derive(Debug, Clone)]
pub struct LeaseHandle {
    resource: String,
    token: String,
    duration: Duration,
    deadline: Instant,
    expires_at: DateTime<Utc>,
}

impl LeaseHandle {
    fn new(resource: &str, token: String, duration: Duration) -> Self {
        let mut handle = Self {
            resource: resource.to_string(),
            token,
            duration,
            deadline: Instant::now(),
            expires_at: Utc::now(),
        };
        handle.extend();
        handle
    }

    fn extend(&mut self) {
        self.deadline = Instant::now() + self.duration;
        self.expires_at = Utc::now()
            + chrono::Duration::from_std(self.duration).unwrap_or_else(|_| chrono::Duration::zero());
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// True once less than half of the lease duration remains
    pub fn needs_renewal(&self) -> bool {
        self.deadline.saturating_duration_since(Instant::now()) < self.duration / 2
    }
}

/// Acquire/renew/release over one named lock resource
#[derive(Clone)]
pub struct LeaseLock {
    store: Arc<dyn LeaseStore>,
    resource: String,
    duration: Duration,
    holder: String,
    call_timeout: Duration,
}

impl LeaseLock {
    /// `holder` prefixes every lease token so store operators can tell who
    /// holds the lease.
    pub fn new(
        store: Arc<dyn LeaseStore>,
        resource: impl Into<String>,
        duration: Duration,
        holder: impl Into<String>,
    ) -> Self {
        Self {
            store,
            resource: resource.into(),
            duration,
            holder: holder.into(),
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
        }
    }

    /// Bound on every single store call
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    async fn bounded<T>(
        &self,
        op: &str,
        call: impl Future<Output = Result<T, ClusterError>>,
    ) -> Result<T, ClusterError> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::LockUnavailable(format!(
                "{} on '{}' timed out after {:?}",
                op, self.resource, self.call_timeout
            ))),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Idempotent create-if-absent; an existing resource is success
    pub async fn ensure_resource_exists(&self) -> Result<(), ClusterError> {
        let outcome = self
            .bounded("create", self.store.create_if_absent(&self.resource))
            .await?;
        match outcome {
            CreateOutcome::Created => {
                tracing::info!(resource = %self.resource, "Created bootstrap lock resource");
            }
            CreateOutcome::AlreadyExists => {
                tracing::debug!(resource = %self.resource, "Bootstrap lock resource already exists");
            }
        }
        Ok(())
    }

    pub async fn try_acquire(&self) -> Result<AcquireOutcome, ClusterError> {
        let token = format!("{}:{:016x}", self.holder, rand::rng().random::<u64>());

        tracing::info!(
            resource = %self.resource,
            duration = ?self.duration,
            "Acquiring bootstrapper lease"
        );

        let acquired = self
            .bounded("acquire", self.store.acquire(&self.resource, &token, self.duration))
            .await?;
        if acquired {
            let handle = LeaseHandle::new(&self.resource, token, self.duration);
            tracing::info!(
                resource = %self.resource,
                expires_at = %handle.expires_at(),
                "Bootstrapper lease acquired"
            );
            Ok(AcquireOutcome::Acquired(handle))
        } else {
            tracing::info!(resource = %self.resource, "Bootstrapper lease held by another instance");
            Ok(AcquireOutcome::AlreadyHeld)
        }
    }

    /// Extends `handle`; returns whether the lease is still ours
    pub async fn renew(&self, handle: &mut LeaseHandle) -> bool {
        let renewed = self
            .bounded("renew", self.store.renew(&handle.resource, &handle.token, handle.duration))
            .await;
        match renewed {
            Ok(true) => {
                handle.extend();
                tracing::debug!(
                    resource = %handle.resource,
                    expires_at = %handle.expires_at,
                    "Renewed bootstrapper lease"
                );
                true
            }
            Ok(false) => {
                tracing::warn!(resource = %handle.resource, "Bootstrapper lease lost before renewal");
                false
            }
            Err(e) => {
                tracing::warn!(resource = %handle.resource, error = %e, "Failed to renew bootstrapper lease");
                false
            }
        }
    }

    /// Best-effort release. Failures are logged and never propagated.
    pub async fn release(&self, handle: LeaseHandle) {
        let released = self
            .bounded("release", self.store.release(&handle.resource, &handle.token))
            .await;
        match released {
            Ok(true) => {
                tracing::info!(resource = %handle.resource, "Released bootstrapper lease");
            }
            Ok(false) => {
                tracing::debug!(
                    resource = %handle.resource,
                    expired = handle.is_expired(),
                    "Bootstrapper lease was no longer held"
                );
            }
            Err(e) => {
                let err = ClusterError::LeaseRelease(e.to_string());
                tracing::warn!(resource = %handle.resource, error = %err, "Ignoring lease release failure");
            }
        }
    }
}

#[derive(Debug)]
struct MemoryLease {
    token: String,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct MemoryState {
    resources: HashSet<String>,
    leases: HashMap<String, MemoryLease>,
}

/// Process-local lease store.
///
/// Only arbitrates between contenders sharing this process; a real fleet
/// needs a shared store such as Redis.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    state: Mutex<MemoryState>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token of the live lease on `resource`, if any
    #[cfg(test)]
    pub async fn holder(&self, resource: &str) -> Option<String> {
        let state = self.state.lock().await;
        state
            .leases
            .get(resource)
            .filter(|lease| lease.deadline > Instant::now())
            .map(|lease| lease.token.clone())
    }

    /// Create `resource` with a live lease held by `token`
    #[cfg(test)]
    pub async fn seed_lease(&self, resource: &str, token: &str, duration: Duration) {
        let mut state = self.state.lock().await;
        state.resources.insert(resource.to_string());
        state.leases.insert(
            resource.to_string(),
            MemoryLease {
                token: token.to_string(),
                deadline: Instant::now() + duration,
            },
        );
    }

    #[cfg(test)]
    pub async fn resource_exists(&self, resource: &str) -> bool {
        self.state.lock().await.resources.contains(resource)
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn create_if_absent(&self, resource: &str) -> Result<CreateOutcome, ClusterError> {
        let mut state = self.state.lock().await;
        if state.resources.insert(resource.to_string()) {
            Ok(CreateOutcome::Created)
        } else {
            Ok(CreateOutcome::AlreadyExists)
        }
    }

    async fn acquire(&self, resource: &str, token: &str, duration: Duration) -> Result<bool, ClusterError> {
        let mut state = self.state.lock().await;
        if !state.resources.contains(resource) {
            return Err(ClusterError::LockStore(format!("lock resource '{}' does not exist", resource)));
        }

        let now = Instant::now();
        if let Some(lease) = state.leases.get(resource) {
            if lease.deadline > now {
                return Ok(false);
            }
        }

        state.leases.insert(
            resource.to_string(),
            MemoryLease {
                token: token.to_string(),
                deadline: now + duration,
            },
        );
        Ok(true)
    }

    async fn renew(&self, resource: &str, token: &str, duration: Duration) -> Result<bool, ClusterError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        match state.leases.get_mut(resource) {
            Some(lease) if lease.token == token && lease.deadline > now => {
                lease.deadline = now + duration;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, resource: &str, token: &str) -> Result<bool, ClusterError> {
        let mut state = self.state.lock().await;
        let held = matches!(
            state.leases.get(resource),
            Some(lease) if lease.token == token && lease.deadline > Instant::now()
        );
        if held {
            state.leases.remove(resource);
        }
        Ok(held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    const RESOURCE: &str = "bootstrap.lock";

    fn lock(store: Arc<dyn LeaseStore>, holder: &str, duration: Duration) -> LeaseLock {
        LeaseLock::new(store, RESOURCE, duration, holder)
    }

    fn acquired(outcome: AcquireOutcome) -> LeaseHandle {
        match outcome {
            AcquireOutcome::Acquired(handle) => handle,
            AcquireOutcome::AlreadyHeld => panic!("expected lease to be acquired"),
        }
    }

    /// Store whose every call fails
    struct BrokenStore;

    #[async_trait]
    impl LeaseStore for BrokenStore {
        async fn create_if_absent(&self, _: &str) -> Result<CreateOutcome, ClusterError> {
            Err(ClusterError::LockUnavailable("connection reset".into()))
        }
        async fn acquire(&self, _: &str, _: &str, _: Duration) -> Result<bool, ClusterError> {
            Err(ClusterError::LockUnavailable("connection reset".into()))
        }
        async fn renew(&self, _: &str, _: &str, _: Duration) -> Result<bool, ClusterError> {
            Err(ClusterError::LockUnavailable("connection reset".into()))
        }
        async fn release(&self, _: &str, _: &str) -> Result<bool, ClusterError> {
            Err(ClusterError::LockUnavailable("connection reset".into()))
        }
    }

    /// Store that never answers
    struct HungStore;

    #[async_trait]
    impl LeaseStore for HungStore {
        async fn create_if_absent(&self, _: &str) -> Result<CreateOutcome, ClusterError> {
            std::future::pending().await
        }
        async fn acquire(&self, _: &str, _: &str, _: Duration) -> Result<bool, ClusterError> {
            std::future::pending().await
        }
        async fn renew(&self, _: &str, _: &str, _: Duration) -> Result<bool, ClusterError> {
            std::future::pending().await
        }
        async fn release(&self, _: &str, _: &str) -> Result<bool, ClusterError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = MemoryLeaseStore::new();
        assert_eq!(store.create_if_absent(RESOURCE).await.unwrap(), CreateOutcome::Created);
        assert_eq!(store.create_if_absent(RESOURCE).await.unwrap(), CreateOutcome::AlreadyExists);

        let lock = lock(Arc::new(store), "node-a", Duration::from_secs(60));
        assert_ok!(lock.ensure_resource_exists().await);
        assert_ok!(lock.ensure_resource_exists().await);
    }

    #[tokio::test]
    async fn test_acquire_requires_resource() {
        let lock = lock(Arc::new(MemoryLeaseStore::new()), "node-a", Duration::from_secs(60));
        assert_err!(lock.try_acquire().await);
    }

    #[tokio::test]
    async fn test_second_contender_sees_held() {
        let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
        let a = lock(store.clone(), "node-a", Duration::from_secs(60));
        let b = lock(store, "node-b", Duration::from_secs(60));
        a.ensure_resource_exists().await.unwrap();

        let handle = acquired(a.try_acquire().await.unwrap());
        assert!(handle.token().starts_with("node-a:"));
        assert!(matches!(b.try_acquire().await.unwrap(), AcquireOutcome::AlreadyHeld));

        a.release(handle).await;
        acquired(b.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_contenders_elect_one() {
        let store = Arc::new(MemoryLeaseStore::new());
        store.create_if_absent(RESOURCE).await.unwrap();

        let attempts = (0..8).map(|i| {
            let lock = lock(store.clone(), &format!("node-{}", i), Duration::from_secs(60));
            async move { lock.try_acquire().await.unwrap() }
        });
        let outcomes = futures::future::join_all(attempts).await;

        let winners = outcomes
            .iter()
            .filter(|o| matches!(o, AcquireOutcome::Acquired(_)))
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken() {
        let store = Arc::new(MemoryLeaseStore::new());
        let a = lock(store.clone(), "node-a", Duration::from_millis(20));
        let b = lock(store.clone(), "node-b", Duration::from_secs(60));
        a.ensure_resource_exists().await.unwrap();

        let stale = acquired(a.try_acquire().await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(stale.is_expired());

        let fresh = acquired(b.try_acquire().await.unwrap());
        assert_eq!(store.holder(RESOURCE).await.as_deref(), Some(fresh.token()));

        // The stale holder's release must not drop the new lease
        a.release(stale).await;
        assert_eq!(store.holder(RESOURCE).await.as_deref(), Some(fresh.token()));
    }

    #[tokio::test]
    async fn test_release_never_fails() {
        let store = Arc::new(MemoryLeaseStore::new());
        let a = lock(store.clone(), "node-a", Duration::from_secs(60));
        a.ensure_resource_exists().await.unwrap();

        let handle = acquired(a.try_acquire().await.unwrap());
        a.release(handle.clone()).await;
        a.release(handle.clone()).await;
        assert!(store.holder(RESOURCE).await.is_none());

        let broken = lock(Arc::new(BrokenStore), "node-a", Duration::from_secs(60));
        broken.release(handle).await;
    }

    #[tokio::test]
    async fn test_renew_extends_and_detects_loss() {
        let store = Arc::new(MemoryLeaseStore::new());
        let a = lock(store.clone(), "node-a", Duration::from_millis(200));
        a.ensure_resource_exists().await.unwrap();

        let mut handle = acquired(a.try_acquire().await.unwrap());
        assert!(!handle.needs_renewal());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(handle.needs_renewal());

        assert!(a.renew(&mut handle).await);
        assert!(!handle.needs_renewal());

        store.release(RESOURCE, handle.token()).await.unwrap();
        assert!(!a.renew(&mut handle).await);

        let broken = lock(Arc::new(BrokenStore), "node-a", Duration::from_millis(200));
        assert!(!broken.renew(&mut handle).await);
    }

    #[tokio::test]
    async fn test_hung_store_times_out() {
        let hung = lock(Arc::new(HungStore), "node-a", Duration::from_secs(60))
            .with_call_timeout(Duration::from_millis(50));

        let calls = async {
            let created = hung.ensure_resource_exists().await;
            assert!(matches!(created, Err(ClusterError::LockUnavailable(_))));

            let attempt = hung.try_acquire().await;
            assert!(matches!(attempt, Err(ClusterError::LockUnavailable(_))));
            assert!(!attempt.unwrap_err().is_fatal());
        };
        assert_ok!(tokio::time::timeout(Duration::from_secs(2), calls).await);

        // Renew and release report through their own channels, still bounded
        let store = Arc::new(MemoryLeaseStore::new());
        let a = lock(store.clone(), "node-a", Duration::from_secs(60));
        a.ensure_resource_exists().await.unwrap();
        let mut handle = acquired(a.try_acquire().await.unwrap());

        let cleanup = async {
            assert!(!hung.renew(&mut handle).await);
            hung.release(handle).await;
        };
        assert_ok!(tokio::time::timeout(Duration::from_secs(2), cleanup).await);
    }
}
