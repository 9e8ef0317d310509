//! Connection registry
//!
//! One pooled client per connection URL and one database handle per
//! (URL, database name), created on first use and kept until [`ConnectionRegistry::close_all`].
//!
//! Each URL owns a `OnceCell` slot, so concurrent first use of a URL runs a
//! single connection setup and every waiter receives the same client. A failed
//! setup leaves the slot empty and the next caller tries again.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tracing::{error, info, warn};

use replimesh_core::{redact_url, PoolConfig, Result};

use crate::driver::{DatabaseHandle, DocumentDriver, DriverClient};

type ClientSlot = Arc<OnceCell<Arc<dyn DriverClient>>>;

pub struct ConnectionRegistry {
    driver: Arc<dyn DocumentDriver>,
    pool: PoolConfig,
    clients: Mutex<HashMap<String, ClientSlot>>,
    databases: Mutex<HashMap<(String, String), Arc<dyn DatabaseHandle>>>,
}

impl ConnectionRegistry {
    pub fn new(driver: Arc<dyn DocumentDriver>, pool: PoolConfig) -> Self {
        Self {
            driver,
            pool,
            clients: Mutex::new(HashMap::new()),
            databases: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &PoolConfig {
        &self.pool
    }

    /// Name of the database used when callers do not pick one
    pub fn default_database_name(&self) -> &str {
        &self.pool.name
    }

    /// Cached client for `url`, connecting on first use
    pub async fn acquire(&self, url: &str) -> Result<Arc<dyn DriverClient>> {
        let slot = {
            let mut clients = self.clients.lock().await;
            clients.entry(url.to_string()).or_default().clone()
        };

        let client = slot
            .get_or_try_init(|| async {
                info!(
                    driver = self.driver.name(),
                    url = %redact_url(url),
                    max_pool_size = self.pool.max_pool_size,
                    "creating new client connection"
                );
                self.driver.connect(url, &self.pool).await.map_err(|e| {
                    error!(url = %redact_url(url), error = %e, "connection setup failed");
                    e
                })
            })
            .await?;

        Ok(client.clone())
    }

    /// Cached database handle for `(url, name)`
    pub async fn database(&self, url: &str, name: &str) -> Result<Arc<dyn DatabaseHandle>> {
        let key = (url.to_string(), name.to_string());
        if let Some(handle) = self.databases.lock().await.get(&key) {
            return Ok(handle.clone());
        }

        let client = self.acquire(url).await?;
        let mut databases = self.databases.lock().await;
        let handle = databases
            .entry(key)
            .or_insert_with(|| client.database(name))
            .clone();
        Ok(handle)
    }

    pub async fn default_database(&self, url: &str) -> Result<Arc<dyn DatabaseHandle>> {
        self.database(url, &self.pool.name).await
    }

    /// Close every cached client and forget all handles. Close failures are
    /// logged, not returned.
    pub async fn close_all(&self) {
        let clients: Vec<(String, ClientSlot)> = self.clients.lock().await.drain().collect();
        self.databases.lock().await.clear();

        for (url, slot) in clients {
            let Some(client) = slot.get() else {
                continue;
            };
            match client.close().await {
                Ok(()) => info!(url = %redact_url(&url), "connection closed"),
                Err(e) => warn!(url = %redact_url(&url), error = %e, "failed to close connection"),
            }
        }
    }

    /// Number of URLs with a live client
    pub async fn len(&self) -> usize {
        self.clients
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDriver;
    use replimesh_core::{DriverError, MeshError};

    fn registry(driver: Arc<MemoryDriver>) -> ConnectionRegistry {
        ConnectionRegistry::new(driver, PoolConfig::default())
    }

    #[tokio::test]
    async fn test_acquire_is_cached() {
        let driver = Arc::new(MemoryDriver::new());
        let reg = registry(driver.clone());

        let first = reg.acquire("memory://a").await.unwrap();
        let second = reg.acquire("memory://a").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(driver.connect_attempts(), 1);

        let db1 = reg.database("memory://a", "school").await.unwrap();
        let db2 = reg.default_database("memory://a").await.unwrap();
        assert!(!Arc::ptr_eq(&db1, &db2));
        let db3 = reg.database("memory://a", "school").await.unwrap();
        assert!(Arc::ptr_eq(&db1, &db3));
        assert_eq!(db2.name(), "siasis_asuncion_8");
    }

    #[tokio::test]
    async fn test_failed_setup_is_retried() {
        let driver = Arc::new(MemoryDriver::new());
        driver.fail_connections_to("memory://flaky");
        let reg = registry(driver.clone());

        let err = reg.acquire("memory://flaky").await.err().unwrap();
        assert!(matches!(
            err,
            MeshError::Driver(DriverError::Connection { .. })
        ));
        assert!(reg.is_empty().await);

        driver.heal("memory://flaky");
        assert!(reg.acquire("memory://flaky").await.is_ok());
        assert_eq!(driver.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_close_all_clears_cache() {
        let driver = Arc::new(MemoryDriver::new());
        let reg = registry(driver.clone());
        let before = reg.acquire("memory://a").await.unwrap();
        reg.acquire("memory://b").await.unwrap();
        assert_eq!(reg.len().await, 2);

        reg.close_all().await;
        assert!(reg.is_empty().await);

        let after = reg.acquire("memory://a").await.unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(driver.connect_attempts(), 3);
    }
}
