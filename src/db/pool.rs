//! Bounded connection pool built on `deadpool`'s managed pool.
//!
//! Checkout waits at most the configured timeout and then fails with
//! [`DalError::PoolExhausted`]. Idle connections are pinged before reuse;
//! connections that failed are taken out of the pool instead of returned.

use std::sync::Arc;
use std::time::Duration;

use deadpool::managed::{self, Metrics, Object, PoolError, RecycleError, RecycleResult};
use deadpool::Runtime;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::driver::{Connection, Driver};
use crate::config::PoolOptions;
use crate::error::{DalError, Result};
use crate::uri::ConnectionUri;

#[derive(Debug)]
pub struct ConnectionManager {
    driver: Arc<dyn Driver>,
    uri: ConnectionUri,
}

impl ConnectionManager {
    pub fn new(driver: Arc<dyn Driver>, uri: ConnectionUri) -> Self {
        Self { driver, uri }
    }
}

impl managed::Manager for ConnectionManager {
    type Type = Box<dyn Connection>;
    type Error = DalError;

    async fn create(&self) -> Result<Box<dyn Connection>> {
        debug!(uri = %self.uri, driver = self.driver.name(), "opening connection");
        self.driver.connect(&self.uri).await
    }

    async fn recycle(
        &self,
        conn: &mut Box<dyn Connection>,
        _metrics: &Metrics,
    ) -> RecycleResult<DalError> {
        if conn.is_broken() {
            return Err(RecycleError::Backend(DalError::Connection {
                backend: self.uri.backend().to_string(),
                message: "connection marked broken".into(),
                source: None,
            }));
        }
        conn.ping().await.map_err(RecycleError::Backend)
    }
}

pub type ConnectionPool = managed::Pool<ConnectionManager>;
pub type PooledConnection = Object<ConnectionManager>;

/// Snapshot of pool occupancy. `in_use + idle <= max_size` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_size: usize,
    pub in_use: usize,
    pub idle: usize,
    pub waiting: usize,
}

pub fn build_pool(
    driver: Arc<dyn Driver>,
    uri: ConnectionUri,
    options: &PoolOptions,
) -> Result<ConnectionPool> {
    if options.max_size == 0 {
        return Err(DalError::Config("pool max_size must be at least 1".into()));
    }
    ConnectionPool::builder(ConnectionManager::new(driver, uri))
        .max_size(options.max_size)
        .wait_timeout(Some(options.checkout_timeout()))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| DalError::Config(format!("cannot build connection pool: {e}")))
}

pub fn status(pool: &ConnectionPool) -> PoolStatus {
    let s = pool.status();
    let idle = s.available as usize;
    PoolStatus {
        max_size: s.max_size,
        in_use: s.size.saturating_sub(idle),
        idle,
        waiting: s.waiting,
    }
}

pub(crate) fn map_pool_error(err: PoolError<DalError>, options: &PoolOptions) -> DalError {
    match err {
        PoolError::Timeout(_) => DalError::PoolExhausted {
            waited: options.checkout_timeout(),
            max_size: options.max_size,
        },
        PoolError::Backend(e) => e,
        PoolError::Closed => DalError::Closed("connection pool".into()),
        PoolError::NoRuntimeSpecified => DalError::Config("pool has no async runtime".into()),
        PoolError::PostCreateHook(e) => DalError::Connection {
            backend: "pool".into(),
            message: e.to_string(),
            source: None,
        },
    }
}

/// Remove a connection from the pool for good. The pool opens a replacement
/// on the next demand.
pub fn discard(conn: PooledConnection) {
    drop(Object::take(conn));
}

/// Wait until no connection is checked out, up to `grace`, then close the
/// pool. Returns `false` when the grace period ran out first.
pub async fn drain(pool: &ConnectionPool, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        let s = status(pool);
        if s.in_use == 0 {
            pool.close();
            return true;
        }
        if Instant::now() >= deadline {
            warn!(in_use = s.in_use, "drain grace period expired; closing pool");
            pool.close();
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
