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
    collections::HashMap,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::{self, ThreadId},
};

use intercept_proxy::tls::{
    normalize_sni, CacheOptions, CacheTier, CertificateCache, CertificateProvider,
    CertificateStore, FileCertificateStore, IssuedCertificate, RcgenCertificateProvider,
    RootCertificate,
};
use intercept_proxy::utils::{ProxyError, ProxyResult};
use tempfile::tempdir;

/// Delegates to rcgen and counts what it was asked to create.
#[derive(Default)]
struct CountingProvider {
    inner: RcgenCertificateProvider,
    roots: AtomicUsize,
    leaves: AtomicUsize,
}

impl CertificateProvider for CountingProvider {
    fn create_root_certificate(&self, issuer: &str) -> ProxyResult<RootCertificate> {
        self.roots.fetch_add(1, Ordering::SeqCst);
        self.inner.create_root_certificate(issuer)
    }

    fn restore_root_certificate(
        &self,
        issuer: &str,
        material: IssuedCertificate,
    ) -> ProxyResult<RootCertificate> {
        self.inner.restore_root_certificate(issuer, material)
    }

    fn create_server_certificate(
        &self,
        host: &str,
        root: &RootCertificate,
    ) -> ProxyResult<IssuedCertificate> {
        self.leaves.fetch_add(1, Ordering::SeqCst);
        self.inner.create_server_certificate(host, root)
    }
}

fn options() -> CacheOptions {
    CacheOptions {
        issuer_name: "Cache Test Root".into(),
        root_name: "cache-test-root".into(),
        create_root_if_missing: true,
        lookup_order: vec![CacheTier::Custom, CacheTier::Memory, CacheTier::Store],
        install_tiers: vec![CacheTier::Memory, CacheTier::Store],
    }
}

fn cache_in(
    dir: &Path,
    provider: Arc<CountingProvider>,
    options: CacheOptions,
) -> ProxyResult<CertificateCache> {
    let store = Arc::new(FileCertificateStore::open(dir)?);
    CertificateCache::new(provider, store, options, None, Vec::new())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_requests_generate_once_per_host() {
    let dir = tempdir().expect("tempdir");
    let provider = Arc::new(CountingProvider::default());
    let cache = Arc::new(cache_in(dir.path(), provider.clone(), options()).expect("cache"));

    let mut tasks = Vec::new();
    for i in 0..100 {
        let cache = cache.clone();
        tasks.push(tokio::spawn(async move {
            let host = format!("host{}.example", i % 10);
            let issued = cache.resolve(&host).await.expect("certificate");
            (host, issued.leaf().to_vec())
        }));
    }

    let mut leaves: HashMap<String, Vec<u8>> = HashMap::new();
    for task in tasks {
        let (host, leaf) = task.await.expect("task");
        let first = leaves.entry(host).or_insert_with(|| leaf.clone());
        assert_eq!(*first, leaf, "every caller sees the same certificate");
    }

    assert_eq!(leaves.len(), 10);
    assert_eq!(provider.leaves.load(Ordering::SeqCst), 10);
    let metrics = cache.metrics();
    assert_eq!(metrics.generated, 10);
    assert_eq!(metrics.hits + metrics.misses, 100);
    assert_eq!(cache.pending_locks(), 0);
}

#[tokio::test]
async fn sni_is_normalized_before_lookup() {
    let dir = tempdir().expect("tempdir");
    let provider = Arc::new(CountingProvider::default());
    let cache = cache_in(dir.path(), provider.clone(), options()).expect("cache");

    let first = cache.resolve("Example.COM").await.expect("issued");
    let second = cache.resolve("example.com.").await.expect("cached");

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(provider.leaves.load(Ordering::SeqCst), 1);
    let metrics = cache.metrics();
    assert_eq!(metrics.misses, 1);
    assert_eq!(metrics.hits, 1);

    assert_eq!(normalize_sni("  WWW.Example.org. "), "www.example.org");
    assert_eq!(normalize_sni(""), "intercept.local");
}

#[test]
fn missing_root_without_creation_is_a_configuration_error() {
    let dir = tempdir().expect("tempdir");
    let provider = Arc::new(CountingProvider::default());
    let options = CacheOptions {
        create_root_if_missing: false,
        ..options()
    };

    let err = cache_in(dir.path(), provider.clone(), options).expect_err("no root available");
    assert!(matches!(err, ProxyError::Configuration(_)), "{err}");
    assert_eq!(provider.roots.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn root_and_leaves_persist_across_restarts() {
    let dir = tempdir().expect("tempdir");

    let provider = Arc::new(CountingProvider::default());
    let cache = cache_in(dir.path(), provider.clone(), options()).expect("first start");
    let root_der = cache.root().der().to_vec();
    let leaf = cache.resolve("persist.example").await.expect("issued");
    assert_eq!(provider.roots.load(Ordering::SeqCst), 1);
    drop(cache);

    let provider = Arc::new(CountingProvider::default());
    let restarted = cache_in(dir.path(), provider.clone(), options()).expect("second start");
    assert_eq!(restarted.root().der().to_vec(), root_der);
    assert_eq!(provider.roots.load(Ordering::SeqCst), 0);

    let again = restarted.resolve("persist.example").await.expect("from store");
    assert_eq!(again.leaf(), leaf.leaf());
    assert_eq!(provider.leaves.load(Ordering::SeqCst), 0);
    assert_eq!(restarted.metrics().hits, 1);
    assert!(restarted.root_pem().starts_with("-----BEGIN CERTIFICATE-----"));
}

#[tokio::test]
async fn uninstall_forces_regeneration() {
    let dir = tempdir().expect("tempdir");
    let provider = Arc::new(CountingProvider::default());
    let cache = cache_in(dir.path(), provider.clone(), options()).expect("cache");

    let first = cache.resolve("gone.example").await.expect("issued");
    cache.uninstall("GONE.example").expect("uninstall");
    let second = cache.resolve("gone.example").await.expect("reissued");

    assert_ne!(first.leaf(), second.leaf());
    assert_eq!(provider.leaves.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn custom_certificates_win_over_generation() {
    let dir = tempdir().expect("tempdir");
    let rcgen = RcgenCertificateProvider;
    let operator_root = rcgen
        .create_root_certificate("Operator Root")
        .expect("operator root");
    let pinned = rcgen
        .create_server_certificate("pinned.example", &operator_root)
        .expect("pinned leaf");

    let provider = Arc::new(CountingProvider::default());
    let store = Arc::new(FileCertificateStore::open(dir.path()).expect("store"));
    let cache = CertificateCache::new(
        provider.clone(),
        store,
        options(),
        Some(operator_root.material().clone()),
        vec![pinned.clone()],
    )
    .expect("cache");

    assert_eq!(cache.root().der(), operator_root.der());
    let served = cache.resolve("Pinned.Example").await.expect("custom hit");
    assert_eq!(served.leaf(), pinned.leaf());
    assert_eq!(provider.roots.load(Ordering::SeqCst), 0);
    assert_eq!(provider.leaves.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn memory_only_cache_does_not_touch_the_store() {
    let dir = tempdir().expect("tempdir");
    let provider = Arc::new(CountingProvider::default());
    let options = CacheOptions {
        lookup_order: vec![CacheTier::Memory],
        install_tiers: vec![CacheTier::Memory],
        ..options()
    };
    let cache = cache_in(dir.path(), provider.clone(), options.clone()).expect("cache");
    cache.resolve("ephemeral.example").await.expect("issued");
    drop(cache);

    let restarted = cache_in(dir.path(), provider.clone(), options).expect("restart");
    restarted.resolve("ephemeral.example").await.expect("reissued");
    assert_eq!(provider.leaves.load(Ordering::SeqCst), 2);
}

/// File store that remembers which threads touched it.
struct ThreadRecordingStore {
    inner: FileCertificateStore,
    threads: Mutex<Vec<ThreadId>>,
}

impl ThreadRecordingStore {
    fn record(&self) {
        self.threads
            .lock()
            .expect("thread log")
            .push(thread::current().id());
    }
}

impl CertificateStore for ThreadRecordingStore {
    fn find(&self, name: &str) -> ProxyResult<Option<IssuedCertificate>> {
        self.record();
        self.inner.find(name)
    }

    fn install(&self, name: &str, certificate: &IssuedCertificate) -> ProxyResult<()> {
        self.record();
        self.inner.install(name, certificate)
    }

    fn uninstall(&self, name: &str) -> ProxyResult<bool> {
        self.inner.uninstall(name)
    }
}

#[tokio::test]
async fn store_io_during_resolve_stays_off_the_runtime_thread() {
    let dir = tempdir().expect("tempdir");
    let store = Arc::new(ThreadRecordingStore {
        inner: FileCertificateStore::open(dir.path()).expect("store"),
        threads: Mutex::new(Vec::new()),
    });
    let cache = CertificateCache::new(
        Arc::new(RcgenCertificateProvider),
        store.clone(),
        options(),
        None,
        Vec::new(),
    )
    .expect("cache");
    // Root creation happens synchronously in the constructor.
    store.threads.lock().expect("thread log").clear();

    cache.resolve("blocking.example").await.expect("issued");
    cache.uninstall("blocking.example").expect("uninstall");
    cache.resolve("blocking.example").await.expect("reissued");

    let runtime_thread = thread::current().id();
    let threads = store.threads.lock().expect("thread log").clone();
    // Two misses search the store twice each, and both generations persist.
    assert_eq!(threads.len(), 6);
    assert!(threads.iter().all(|id| *id != runtime_thread));
}
