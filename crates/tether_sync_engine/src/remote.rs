//! The remote side of reconciliation.

use crate::client::SyncClient;
use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tether_model::Entity;
use tether_storage::{EntityStore, InMemoryStore, Query};
use tether_sync_protocol::{FetchSpec, WirePackage};

/// What the sync engine pulls from and pushes to.
///
/// Implemented by [`SyncClient`] for real servers and by [`MockRemote`]
/// for tests.
pub trait RemoteAuthority: Send + Sync + 'static {
    /// Returns true if requests can be made now.
    fn is_connected(&self) -> bool;

    /// Connects unless already connected.
    fn ensure_connected(&self) -> impl Future<Output = SyncResult<()>> + Send;

    /// Fetches one page of entities.
    fn fetch_page(&self, spec: FetchSpec) -> impl Future<Output = SyncResult<Vec<Entity>>> + Send;

    /// Sends a command without waiting for an answer.
    fn push(&self, package: WirePackage) -> SyncResult<()>;
}

impl RemoteAuthority for SyncClient {
    fn is_connected(&self) -> bool {
        SyncClient::is_connected(self)
    }

    async fn ensure_connected(&self) -> SyncResult<()> {
        SyncClient::ensure_connected(self).await
    }

    async fn fetch_page(&self, spec: FetchSpec) -> SyncResult<Vec<Entity>> {
        Ok(self.fetch(spec).await?.result_entities)
    }

    fn push(&self, package: WirePackage) -> SyncResult<()> {
        self.send(package)
    }
}

/// A remote authority backed by an in-memory store, for testing.
///
/// Fetches are answered from the store; pushed packages are recorded and
/// not applied.
#[derive(Debug)]
pub struct MockRemote {
    store: Arc<InMemoryStore>,
    pushed: Mutex<Vec<WirePackage>>,
    connected: AtomicBool,
    fail_fetches: AtomicBool,
    fetches: AtomicUsize,
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemote {
    /// Creates a connected mock over an empty store.
    pub fn new() -> Self {
        Self::with_store(Arc::new(InMemoryStore::new()))
    }

    /// Creates a connected mock over `store`.
    pub fn with_store(store: Arc<InMemoryStore>) -> Self {
        Self {
            store,
            pushed: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            fail_fetches: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
        }
    }

    /// The store fetches are answered from.
    pub fn store(&self) -> &Arc<InMemoryStore> {
        &self.store
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Makes every fetch fail with a server error.
    pub fn set_fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// Packages pushed so far.
    pub fn pushed(&self) -> Vec<WirePackage> {
        self.pushed.lock().clone()
    }

    /// Forgets recorded pushes.
    pub fn clear_pushed(&self) {
        self.pushed.lock().clear();
    }

    /// Number of fetches answered or failed.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn answer(&self, spec: &FetchSpec) -> SyncResult<Vec<Entity>> {
        let predicate = spec.query.as_deref().map(Query::parse).transpose()?;
        let take = if spec.take == 0 {
            usize::MAX
        } else {
            spec.take as usize
        };
        Ok(self.store.get_first(
            &spec.type_descriptor,
            take,
            spec.skip as usize,
            predicate.as_ref(),
            spec.include_all,
        )?)
    }
}

impl RemoteAuthority for MockRemote {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn ensure_connected(&self) -> SyncResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SyncError::NotConnected)
        }
    }

    async fn fetch_page(&self, spec: FetchSpec) -> SyncResult<Vec<Entity>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(SyncError::Remote("mock fetch failure".into()));
        }
        self.answer(&spec)
    }

    fn push(&self, package: WirePackage) -> SyncResult<()> {
        self.pushed.lock().push(package);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_sync_protocol::PackageMethod;

    #[tokio::test]
    async fn mock_answers_pages_from_its_store() {
        let remote = MockRemote::new();
        for i in 0..5 {
            remote
                .store()
                .create(&Entity::new("Person").with("n", i as i64))
                .unwrap();
        }

        let page = remote
            .fetch_page(FetchSpec::new("Person").with_page(2, 0))
            .await
            .unwrap();
        assert_eq!(page.len(), 2);

        let rest = remote
            .fetch_page(FetchSpec::new("Person").with_page(10, 4))
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);

        let all = remote.fetch_page(FetchSpec::new("Person")).await.unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(remote.fetch_count(), 3);
    }

    #[tokio::test]
    async fn mock_reports_disconnect_and_failures() {
        let remote = MockRemote::new();
        remote.set_connected(false);
        assert!(matches!(
            remote.ensure_connected().await,
            Err(SyncError::NotConnected)
        ));

        remote.set_connected(true);
        remote.set_fail_fetches(true);
        let err = remote.fetch_page(FetchSpec::new("Person")).await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(_)));
    }

    #[tokio::test]
    async fn mock_rejects_bad_query_text() {
        let remote = MockRemote::new();
        let err = remote
            .fetch_page(FetchSpec::new("Person").with_query("ModifiedAt >>"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));
    }

    #[test]
    fn mock_records_pushes() {
        let remote = MockRemote::new();
        remote
            .push(WirePackage::command(PackageMethod::Update, Entity::new("Person")))
            .unwrap();
        assert_eq!(remote.pushed().len(), 1);
        remote.clear_pushed();
        assert!(remote.pushed().is_empty());
    }
}
