//! Redis-backed lease store.
//!
//! The lock resource is a plain key created with `SET NX`; the lease is a
//! sibling key holding the owner's token with a `PX` expiry. Token checks
//! run inside Lua scripts so renew and release are atomic compare-and-act.

use std::time::Duration;

use async_trait::async_trait;
use muster_common::ClusterError;
use muster_common::constants::lock::RESOURCE_MARKER;
use redis::Script;
use redis::aio::ConnectionManager;

use super::lease::{CreateOutcome, LeaseStore};

/// Returns -1 when the resource is missing, 1 when acquired, 0 when held
const ACQUIRE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -1
end
if redis.call('SET', KEYS[2], ARGV[1], 'NX', 'PX', ARGV[2]) then
    return 1
end
return 0
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Lease store shared by the whole fleet through Redis
pub struct RedisLeaseStore {
    redis: ConnectionManager,
    container: String,
    acquire_script: Script,
    renew_script: Script,
    release_script: Script,
}

impl RedisLeaseStore {
    /// Connect with an auto-reconnecting connection manager
    pub async fn connect(redis_url: &str, container: impl Into<String>) -> Result<Self, ClusterError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| ClusterError::LockStore(format!("invalid Redis URL: {}", e)))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| ClusterError::LockStore(format!("failed to connect to Redis: {}", e)))?;

        Ok(Self {
            redis,
            container: container.into(),
            acquire_script: Script::new(ACQUIRE_SCRIPT),
            renew_script: Script::new(RENEW_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        })
    }

    fn resource_key(&self, resource: &str) -> String {
        resource_key(&self.container, resource)
    }

    fn lease_key(&self, resource: &str) -> String {
        lease_key(&self.container, resource)
    }
}

fn resource_key(container: &str, resource: &str) -> String {
    format!("{}:{}", container, resource)
}

fn lease_key(container: &str, resource: &str) -> String {
    format!("{}:{}:lease", container, resource)
}

/// Connection trouble is transient; anything else is a broken store
fn store_error(e: redis::RedisError) -> ClusterError {
    if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal() {
        ClusterError::LockUnavailable(e.to_string())
    } else {
        ClusterError::LockStore(e.to_string())
    }
}

fn millis(duration: Duration) -> u64 {
    (duration.as_millis() as u64).max(1)
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn create_if_absent(&self, resource: &str) -> Result<CreateOutcome, ClusterError> {
        let mut conn = self.redis.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.resource_key(resource))
            .arg(RESOURCE_MARKER)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;

        Ok(match reply {
            Some(_) => CreateOutcome::Created,
            None => CreateOutcome::AlreadyExists,
        })
    }

    async fn acquire(&self, resource: &str, token: &str, duration: Duration) -> Result<bool, ClusterError> {
        let mut conn = self.redis.clone();
        let reply: i64 = self
            .acquire_script
            .key(self.resource_key(resource))
            .key(self.lease_key(resource))
            .arg(token)
            .arg(millis(duration))
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;

        match reply {
            1 => Ok(true),
            0 => Ok(false),
            _ => Err(ClusterError::LockStore(format!(
                "lock resource '{}' does not exist",
                self.resource_key(resource)
            ))),
        }
    }

    async fn renew(&self, resource: &str, token: &str, duration: Duration) -> Result<bool, ClusterError> {
        let mut conn = self.redis.clone();
        let reply: i64 = self
            .renew_script
            .key(self.lease_key(resource))
            .arg(token)
            .arg(millis(duration))
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;

        Ok(reply == 1)
    }

    async fn release(&self, resource: &str, token: &str) -> Result<bool, ClusterError> {
        let mut conn = self.redis.clone();
        let reply: i64 = self
            .release_script
            .key(self.lease_key(resource))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;

        Ok(reply == 1)
    }
}
