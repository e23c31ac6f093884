//! Process-level bookkeeping of open instances.
//!
//! One [`Instance`] exists per connection signature (normalised URI plus pool
//! parameters). Opening the same signature again hands out the same instance
//! and bumps its reference count; the last `close` drains its pool.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::codec::{Codec, ProfileCodec};
use crate::config::OpenOptions;
use crate::db::{Adapter, Driver, InstanceState, MemoryDriver};
use crate::dialect::Backend;
use crate::error::{DalError, Result};
use crate::migrate::{Ledger, Migrator};
use crate::schema::Schema;
use crate::uri::ConnectionUri;

/// An adapter with its migrator, shared by everyone who opened the same
/// signature.
#[derive(Debug)]
pub struct Instance {
    key: u64,
    adapter: Arc<Adapter>,
    migrator: Migrator,
}

impl Instance {
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn adapter(&self) -> &Arc<Adapter> {
        &self.adapter
    }

    pub fn migrator(&self) -> &Migrator {
        &self.migrator
    }

    pub fn schema(&self) -> &Arc<Schema> {
        self.adapter.schema()
    }

    pub fn state(&self) -> InstanceState {
        self.adapter.state()
    }
}

struct Entry {
    instance: Arc<Instance>,
    refs: usize,
}

/// Registry of open instances. Tests build their own; applications usually
/// share [`InstanceRegistry::global`].
pub struct InstanceRegistry {
    drivers: Mutex<HashMap<Backend, Arc<dyn Driver>>>,
    entries: Mutex<HashMap<u64, Entry>>,
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("drivers", &self.drivers.lock().keys().collect::<Vec<_>>())
            .field("instances", &self.entries.lock().len())
            .finish()
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceRegistry {
    /// A registry with the built-in drivers registered.
    pub fn new() -> Self {
        let mut drivers: HashMap<Backend, Arc<dyn Driver>> = HashMap::new();
        drivers.insert(Backend::Memory, Arc::new(MemoryDriver::new()));
        #[cfg(feature = "postgres")]
        drivers.insert(Backend::Postgres, Arc::new(crate::db::PostgresDriver));
        Self {
            drivers: Mutex::new(drivers),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn global() -> Arc<InstanceRegistry> {
        static GLOBAL: OnceLock<Arc<InstanceRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(InstanceRegistry::new())))
    }

    /// Use `driver` for every URI of `backend` opened from now on.
    pub fn register_driver(&self, backend: Backend, driver: Arc<dyn Driver>) {
        self.drivers.lock().insert(backend, driver);
    }

    fn driver_for(&self, uri: &ConnectionUri, options: &OpenOptions) -> Result<Arc<dyn Driver>> {
        if let Some(driver) = &options.driver {
            return Ok(Arc::clone(driver));
        }
        self.drivers
            .lock()
            .get(&uri.backend())
            .cloned()
            .ok_or_else(|| DalError::UnsupportedBackend {
                scheme: uri.scheme().to_string(),
                reason: "no driver registered for this backend".into(),
            })
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reference count of `instance`, or 0 when it is not registered.
    pub fn refcount(&self, instance: &Instance) -> usize {
        self.entries
            .lock()
            .get(&instance.key)
            .filter(|e| std::ptr::eq(Arc::as_ptr(&e.instance), instance))
            .map_or(0, |e| e.refs)
    }

    pub async fn open(&self, uri: &str, options: &OpenOptions) -> Result<Arc<Instance>> {
        let uri = ConnectionUri::parse(uri)?;
        self.open_uri(uri, options).await
    }

    pub async fn open_uri(&self, uri: ConnectionUri, options: &OpenOptions) -> Result<Arc<Instance>> {
        let key = uri.signature(&options.signature_params());

        let existing = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&key) {
                Some(entry) => {
                    entry.refs += 1;
                    Some(Arc::clone(&entry.instance))
                }
                None => None,
            }
        };
        if let Some(instance) = existing {
            if instance.state() == InstanceState::Zombie {
                if let Err(e) = instance.adapter.rebind().await {
                    if let Some(Ok(last)) = self.release(&instance) {
                        last.adapter.drain().await;
                    }
                    return Err(e);
                }
            }
            return Ok(instance);
        }

        let driver = self.driver_for(&uri, options)?;
        let instance = Arc::new(build(key, uri, driver, options).await?);

        // Another caller may have opened the same signature meanwhile.
        let winner = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&key) {
                Some(entry) => {
                    entry.refs += 1;
                    Some(Arc::clone(&entry.instance))
                }
                None => {
                    entries.insert(
                        key,
                        Entry {
                            instance: Arc::clone(&instance),
                            refs: 1,
                        },
                    );
                    None
                }
            }
        };
        match winner {
            Some(existing) => {
                instance.adapter.drain().await;
                Ok(existing)
            }
            None => Ok(instance),
        }
    }

    /// Drop one reference; returns the entry when it was the last one.
    fn release(&self, instance: &Arc<Instance>) -> Option<Result<Arc<Instance>>> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries
            .get_mut(&instance.key)
            .filter(|e| Arc::ptr_eq(&e.instance, instance))
        else {
            return Some(Err(DalError::Closed(instance.adapter.uri().to_string())));
        };
        entry.refs -= 1;
        if entry.refs > 0 {
            return None;
        }
        entries.remove(&instance.key).map(|e| Ok(e.instance))
    }

    /// Give back one reference. The last one drains the pool, waiting up to
    /// the grace period for in-flight work.
    pub async fn close(&self, instance: &Arc<Instance>) -> Result<()> {
        match self.release(instance) {
            None => Ok(()),
            Some(Err(e)) => Err(e),
            Some(Ok(last)) => {
                let clean = last.adapter.drain().await;
                if !clean {
                    warn!(uri = %last.adapter.uri(), "pool closed with connections still in use");
                }
                Ok(())
            }
        }
    }

    /// Flag `instance` as a zombie. The next `open` of its signature rebinds
    /// a fresh pool.
    pub fn mark_zombie(&self, instance: &Instance) {
        instance.adapter.mark_zombie();
    }

    /// Mark every instance zombie, as after a fork.
    pub fn mark_all_zombie(&self) {
        let instances: Vec<Arc<Instance>> = self
            .entries
            .lock()
            .values()
            .map(|e| Arc::clone(&e.instance))
            .collect();
        for instance in instances {
            instance.adapter.mark_zombie();
        }
    }
}

async fn build(
    key: u64,
    uri: ConnectionUri,
    driver: Arc<dyn Driver>,
    options: &OpenOptions,
) -> Result<Instance> {
    let mut ledger = match &options.migration_folder {
        Some(folder) => Ledger::load(folder, uri.signature(&()))?,
        None => Ledger::in_memory(),
    };
    // Naive timestamps already written stay in the zone they were written in.
    let zone = match ledger.zone()? {
        Some(recorded) => {
            if recorded != options.assumed_zone {
                warn!(
                    recorded = %recorded,
                    requested = %options.assumed_zone,
                    "ledger records a different assumed zone; keeping the recorded one"
                );
            }
            recorded
        }
        None => {
            ledger.set_zone(options.assumed_zone);
            ledger.save()?;
            options.assumed_zone
        }
    };

    let backend = uri.backend();
    let codec: Arc<dyn Codec> = match &options.hooks.codec {
        Some(codec) => Arc::clone(codec),
        None => Arc::new(ProfileCodec::for_backend(backend, zone)),
    };
    let adapter = Arc::new(
        Adapter::connect(
            uri,
            driver,
            backend.dialect(),
            codec,
            Arc::new(Schema::new()),
            options,
        )
        .await?,
    );
    info!(uri = %adapter.uri(), backend = %backend, key = format!("{key:016x}"), "instance opened");
    let migrator = Migrator::new(Arc::clone(&adapter), ledger);
    Ok(Instance {
        key,
        adapter,
        migrator,
    })
}
