/* STATIC Proxy (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use std::{
    fs,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use serde::Deserialize;
use tokio::{sync::Mutex, task};

use super::{
    authority::{CertificateProvider, IssuedCertificate, RootCertificate},
    store::{certificate_from_pem, chain_to_pem, CertificateStore},
};
use crate::{
    config::TlsConfig,
    utils::{ProxyError, ProxyResult},
};

const FALLBACK_SNI: &str = "intercept.local";

/// Where a certificate can live. The cache searches tiers in the configured order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// Process-lifetime map.
    Memory,
    /// The persistent [`CertificateStore`].
    Store,
    /// Operator-supplied certificates loaded at startup.
    Custom,
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub issuer_name: String,
    pub root_name: String,
    pub create_root_if_missing: bool,
    pub lookup_order: Vec<CacheTier>,
    pub install_tiers: Vec<CacheTier>,
}

impl From<&TlsConfig> for CacheOptions {
    fn from(cfg: &TlsConfig) -> Self {
        Self {
            issuer_name: cfg.issuer_name.clone(),
            root_name: cfg.root_name.clone(),
            create_root_if_missing: cfg.create_root_if_missing,
            lookup_order: cfg.lookup_order.clone(),
            install_tiers: cfg.install_tiers.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub generated: u64,
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    generated: AtomicU64,
}

impl CacheStats {
    fn snapshot(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            generated: self.generated.load(Ordering::Relaxed),
        }
    }
}

/// Resolves the certificate presented to intercepted clients for a given host.
///
/// Lookups walk the tiers in `lookup_order`; a miss generates a certificate on a blocking
/// thread and installs it into every tier in `install_tiers`. Generation for one host is
/// serialized through a per-host lock and the tiers are searched again once the lock is held,
/// so concurrent first requests for a host share one certificate. Locks for different
/// hosts never contend, and a host's lock is dropped from the registry once unused.
pub struct CertificateCache {
    provider: Arc<dyn CertificateProvider>,
    store: Arc<dyn CertificateStore>,
    root: Arc<RootCertificate>,
    memory: DashMap<String, Arc<IssuedCertificate>>,
    custom: DashMap<String, Arc<IssuedCertificate>>,
    host_locks: DashMap<String, Arc<Mutex<()>>>,
    options: CacheOptions,
    stats: CacheStats,
}

impl std::fmt::Debug for CertificateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateCache")
            .field("root", &self.root)
            .field("memory", &self.memory.len())
            .field("custom", &self.custom.len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl CertificateCache {
    /// Builds the cache and resolves the root certificate.
    ///
    /// Root lookup order: `custom_root`, then the store under `root_name`, then a freshly
    /// created root when `create_root_if_missing` is set. Anything else is a
    /// configuration error.
    pub fn new(
        provider: Arc<dyn CertificateProvider>,
        store: Arc<dyn CertificateStore>,
        options: CacheOptions,
        custom_root: Option<IssuedCertificate>,
        custom_certificates: Vec<IssuedCertificate>,
    ) -> ProxyResult<Self> {
        let root = Self::resolve_root(provider.as_ref(), store.as_ref(), &options, custom_root)?;

        let custom = DashMap::new();
        for certificate in custom_certificates {
            custom.insert(normalize_sni(certificate.name()), Arc::new(certificate));
        }

        Ok(Self {
            provider,
            store,
            root: Arc::new(root),
            memory: DashMap::new(),
            custom,
            host_locks: DashMap::new(),
            options,
            stats: CacheStats::default(),
        })
    }

    /// Loads custom material named in `cfg` from disk and builds the cache.
    pub fn from_config(
        provider: Arc<dyn CertificateProvider>,
        store: Arc<dyn CertificateStore>,
        cfg: &TlsConfig,
    ) -> ProxyResult<Self> {
        let custom_root = cfg
            .custom_root
            .as_ref()
            .map(|paths| {
                certificate_from_pem(
                    &cfg.root_name,
                    &fs::read(&paths.cert_path)?,
                    &fs::read(&paths.key_path)?,
                )
            })
            .transpose()?;
        let custom = cfg
            .custom_certificates
            .iter()
            .map(|entry| {
                certificate_from_pem(
                    &entry.host,
                    &fs::read(&entry.cert_path)?,
                    &fs::read(&entry.key_path)?,
                )
            })
            .collect::<ProxyResult<Vec<_>>>()?;

        Self::new(provider, store, CacheOptions::from(cfg), custom_root, custom)
    }

    fn resolve_root(
        provider: &dyn CertificateProvider,
        store: &dyn CertificateStore,
        options: &CacheOptions,
        custom_root: Option<IssuedCertificate>,
    ) -> ProxyResult<RootCertificate> {
        if let Some(material) = custom_root {
            tracing::info!(root = %options.root_name, "using custom root certificate");
            return provider.restore_root_certificate(&options.issuer_name, material);
        }
        if let Some(material) = store.find(&options.root_name)? {
            tracing::info!(root = %options.root_name, "loaded root certificate from store");
            return provider.restore_root_certificate(&options.issuer_name, material);
        }
        if !options.create_root_if_missing {
            return Err(ProxyError::Configuration(format!(
                "root certificate {:?} not found and creation is disabled",
                options.root_name
            )));
        }

        let root = provider.create_root_certificate(&options.issuer_name)?;
        store.install(&options.root_name, root.material())?;
        tracing::info!(root = %options.root_name, issuer = %options.issuer_name, "created new root certificate");
        Ok(root)
    }

    pub fn root(&self) -> &RootCertificate {
        &self.root
    }

    /// PEM of the root certificate, for clients to add to their trust store.
    pub fn root_pem(&self) -> String {
        chain_to_pem(std::slice::from_ref(self.root.der()))
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.stats.snapshot()
    }

    /// Number of hosts with a generation lock currently registered.
    pub fn pending_locks(&self) -> usize {
        self.host_locks.len()
    }

    pub async fn resolve(&self, host: &str) -> ProxyResult<Arc<IssuedCertificate>> {
        let host = normalize_sni(host);

        if let Some(hit) = self.lookup(&host).await? {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(sni = %host, "certificate cache hit");
            return Ok(hit);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let lock = self
            .host_locks
            .entry(host.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            match self.lookup(&host).await {
                Ok(Some(hit)) => Ok(hit),
                Ok(None) => self.generate(&host).await,
                Err(err) => Err(err),
            }
        };

        // Only the registry and this task hold the lock now: nobody is waiting on it.
        self.host_locks
            .remove_if(&host, |_, registered| Arc::strong_count(registered) == 2);
        result
    }

    /// Removes `host` from every tier.
    pub fn uninstall(&self, host: &str) -> ProxyResult<()> {
        let host = normalize_sni(host);
        self.memory.remove(&host);
        self.custom.remove(&host);
        self.store.uninstall(&host)?;
        tracing::debug!(sni = %host, "certificate uninstalled");
        Ok(())
    }

    async fn lookup(&self, host: &str) -> ProxyResult<Option<Arc<IssuedCertificate>>> {
        for tier in &self.options.lookup_order {
            let hit = match tier {
                CacheTier::Memory => self.memory.get(host).map(|entry| entry.value().clone()),
                CacheTier::Custom => self.custom.get(host).map(|entry| entry.value().clone()),
                CacheTier::Store => self.lookup_store(host).await?,
            };
            if hit.is_some() {
                return Ok(hit);
            }
        }
        Ok(None)
    }

    /// Store lookups hit the filesystem, so they run on the blocking pool.
    async fn lookup_store(&self, host: &str) -> ProxyResult<Option<Arc<IssuedCertificate>>> {
        let store = self.store.clone();
        let name = host.to_string();
        let found = task::spawn_blocking(move || store.find(&name))
            .await
            .map_err(|err| ProxyError::Certificate(format!("store lookup task failed: {err}")))??;

        Ok(found.map(|found| {
            let found = Arc::new(found);
            if self.options.lookup_order.contains(&CacheTier::Memory) {
                self.memory.insert(host.to_string(), found.clone());
            }
            found
        }))
    }

    async fn generate(&self, host: &str) -> ProxyResult<Arc<IssuedCertificate>> {
        let provider = self.provider.clone();
        let root = self.root.clone();
        let store = self
            .options
            .install_tiers
            .contains(&CacheTier::Store)
            .then(|| self.store.clone());
        let target = host.to_string();
        let issued = task::spawn_blocking(move || -> ProxyResult<IssuedCertificate> {
            let issued = provider.create_server_certificate(&target, &root)?;
            if let Some(store) = store {
                if let Err(err) = store.install(&target, &issued) {
                    tracing::warn!(sni = %target, error = %err, "failed to persist certificate");
                }
            }
            Ok(issued)
        })
        .await
        .map_err(|err| ProxyError::Certificate(format!("certificate task failed: {err}")))??;

        let issued = Arc::new(issued);
        for tier in &self.options.install_tiers {
            match tier {
                CacheTier::Memory => {
                    self.memory.insert(host.to_string(), issued.clone());
                }
                CacheTier::Custom => {
                    self.custom.insert(host.to_string(), issued.clone());
                }
                CacheTier::Store => {}
            }
        }

        self.stats.generated.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(sni = %host, "issued new leaf certificate");
        Ok(issued)
    }
}

/// Lowercases the SNI name and substitutes a fallback for an empty one.
pub fn normalize_sni(server_name: &str) -> String {
    let trimmed = server_name.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        FALLBACK_SNI.to_string()
    } else {
        trimmed.to_ascii_lowercase()
    }
}
