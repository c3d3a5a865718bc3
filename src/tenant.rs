use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;

use crate::engine::{Engine, TransitionPolicy};
use crate::limits::*;
use crate::sweeper;

/// Settings every tenant engine is started with.
#[derive(Debug, Clone, Copy)]
pub struct TenantOptions {
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub policy: TransitionPolicy,
}

impl Default for TenantOptions {
    fn default() -> Self {
        Self {
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(60),
            policy: TransitionPolicy::default(),
        }
    }
}

/// One engine per hotel property. The property is the database name of the
/// pgwire connection; each gets its own WAL, sweeper and compactor.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    options: TenantOptions,
}

/// The tenant name is used as the WAL file stem as-is, so it may only hold
/// lowercase ASCII letters, digits, `_` and `-`. Distinct names map to
/// distinct files, case-insensitive file systems included.
fn wal_file_stem(tenant: &str) -> io::Result<&str> {
    if tenant.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
    }
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
    }
    if let Some(c) = tenant
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-'))
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("tenant name contains {c:?}; only lowercase letters, digits, '_' and '-' are allowed"),
        ));
    }
    Ok(tenant)
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, options: TenantOptions) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            options,
        }
    }

    /// Get or lazily open the engine for a tenant.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        let stem = wal_file_stem(tenant)?;
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        // The entry lock keeps two first connections from opening the same WAL twice.
        // No other map access while it is held: `len()` would wait on this shard.
        let entry = match self.engines.entry(tenant.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => return Ok(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(v) => v,
        };

        let wal_path = self.data_dir.join(format!("{stem}.wal"));
        let engine = Arc::new(Engine::new(wal_path, self.options.policy)?);

        tokio::spawn(sweeper::run_sweeper(engine.clone(), self.options.sweep_interval));
        tokio::spawn(sweeper::run_compactor(engine.clone(), self.options.compact_threshold));

        entry.insert(engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        info!(tenant, "tenant opened");
        Ok(engine)
    }
}
