//! Reconciliation engine.
//!
//! One cycle walks every observed type: pull remote changes since the last
//! checkpoint and apply them last-write-wins, push local unsynced entities,
//! then prune the local copy down to the retention cap. The checkpoint only
//! moves forward when the whole cycle went through without a failed item.

use crate::cache::EntityCache;
use crate::config::{ObservingType, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteAuthority;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_model::{Entity, EntityId, ImageAttachment, TypeRegistry};
use tether_storage::{EntityStore, ImageStore, Query};
use tether_sync_protocol::{FetchSpec, PackageMethod, WirePackage};
use tether_transport::Shutdown;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Type descriptor of the stored checkpoint record.
pub const CHECKPOINT_TYPE: &str = "tether.SyncCheckpoint";

const LAST_SYNC: &str = "LastSync";

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Engine is idle, not syncing.
    Idle,
    /// Engine is pulling remote changes.
    Pulling,
    /// Engine is pushing local changes.
    Pushing,
    /// Engine is enforcing retention caps.
    Pruning,
    /// The last cycle completed without failures.
    Synced,
    /// The last cycle failed or had failed items.
    Error,
}

impl SyncState {
    /// Returns true while a cycle is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Pulling | SyncState::Pushing | SyncState::Pruning
        )
    }
}

/// Statistics about sync cycles.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles that ran to the end.
    pub cycles_completed: u64,
    /// Cycles that aborted or had failed items.
    pub cycles_failed: u64,
    /// Ticks dropped because a cycle was still running.
    pub cycles_skipped: u64,
    /// Remote entities examined.
    pub items_pulled: u64,
    /// Packages pushed.
    pub items_pushed: u64,
    /// Local entities removed by retention.
    pub items_pruned: u64,
    /// Items that failed to reconcile.
    pub item_failures: u64,
    /// Start of the last fully successful cycle.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of a sync cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncCycleResult {
    /// Remote entities examined.
    pub pulled: u64,
    /// Remote entities inserted locally.
    pub inserted: u64,
    /// Local entities replaced by newer remote versions.
    pub updated: u64,
    /// Local entities deleted because the remote copy was archived.
    pub deleted: u64,
    /// Remote entities not newer than the local copy.
    pub skipped: u64,
    /// Entities and attachments pushed.
    pub pushed: u64,
    /// Local entities removed by retention.
    pub pruned: u64,
    /// Per-item failures.
    pub errors: Vec<String>,
    /// True if every item went through.
    pub success: bool,
    /// Duration of the cycle.
    pub duration: Duration,
}

/// What to do with a remote entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Not stored locally: insert it.
    Insert,
    /// Remote is newer: replace the local copy.
    Update,
    /// Remote is newer and archived: delete the local copy.
    Delete,
    /// Local copy is as new or newer: keep it.
    Skip,
}

/// Last-write-wins decision for one remote entity.
///
/// Ties keep the local copy.
pub fn reconcile(local: Option<&Entity>, remote: &Entity) -> ReconcileAction {
    match local {
        None => ReconcileAction::Insert,
        Some(local) if remote.modified_at > local.modified_at => {
            if remote.archived {
                ReconcileAction::Delete
            } else {
                ReconcileAction::Update
            }
        }
        Some(_) => ReconcileAction::Skip,
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The sync engine reconciles a local store with a remote authority.
pub struct SyncEngine<R: RemoteAuthority, S: EntityStore + ImageStore + 'static> {
    config: SyncConfig,
    remote: Arc<R>,
    store: Arc<S>,
    registry: Option<Arc<TypeRegistry>>,
    cache: Option<Arc<EntityCache>>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    busy: AtomicBool,
}

impl<R: RemoteAuthority, S: EntityStore + ImageStore + 'static> SyncEngine<R, S> {
    /// Creates a new sync engine.
    pub fn new(config: SyncConfig, remote: Arc<R>, store: Arc<S>) -> Self {
        Self {
            config,
            remote,
            store,
            registry: None,
            cache: None,
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            busy: AtomicBool::new(false),
        }
    }

    /// Conforms pulled entities to their registered type shapes.
    pub fn with_registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Keeps `cache` in step with local changes.
    pub fn with_cache(mut self, cache: Arc<EntityCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// The engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The remote authority.
    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns true while a cycle is running.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    /// Start of the last fully successful cycle, as stored.
    pub fn last_sync(&self) -> SyncResult<Option<DateTime<Utc>>> {
        let record = self.store.get_by_id(CHECKPOINT_TYPE, EntityId::nil(), false)?;
        Ok(record.and_then(|r| r.get(LAST_SYNC).and_then(|v| v.as_timestamp())))
    }

    /// Stores the checkpoint.
    pub fn set_last_sync(&self, at: DateTime<Utc>) -> SyncResult<()> {
        self.store.ensure_schema(CHECKPOINT_TYPE)?;
        let mut record = Entity::with_id(EntityId::nil(), CHECKPOINT_TYPE).with(LAST_SYNC, at);
        record.synced = true;
        self.store.upsert(&record)?;
        Ok(())
    }

    /// Lower bound for the next pull.
    pub fn pull_since(&self) -> SyncResult<DateTime<Utc>> {
        let since = match self.last_sync()? {
            Some(last) => last - chrono_duration(self.config.checkpoint_overlap),
            None => Utc::now() - chrono_duration(self.config.initial_lookback),
        };
        Ok(since)
    }

    /// Runs one cycle.
    ///
    /// Returns [`SyncError::Busy`] without doing anything if a cycle is
    /// already running.
    pub async fn sync(&self) -> SyncResult<SyncCycleResult> {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.stats.write().cycles_skipped += 1;
            trace!("sync cycle already running, tick dropped");
            return Err(SyncError::Busy);
        }
        let _busy = BusyGuard(&self.busy);

        let start = Instant::now();
        let started_at = Utc::now();

        let outcome = self.run_cycle(started_at).await;
        let mut stats = self.stats.write();
        match outcome {
            Ok(mut result) => {
                result.duration = start.elapsed();
                stats.items_pulled += result.pulled;
                stats.items_pushed += result.pushed;
                stats.items_pruned += result.pruned;
                stats.item_failures += result.errors.len() as u64;
                if result.success {
                    stats.cycles_completed += 1;
                    stats.last_sync_time = Some(started_at);
                    stats.last_error = None;
                    drop(stats);
                    self.set_state(SyncState::Synced);
                } else {
                    stats.cycles_failed += 1;
                    stats.last_error = result.errors.last().cloned();
                    drop(stats);
                    self.set_state(SyncState::Error);
                }
                info!(
                    pulled = result.pulled,
                    pushed = result.pushed,
                    pruned = result.pruned,
                    failures = result.errors.len(),
                    "sync cycle finished"
                );
                Ok(result)
            }
            Err(e) => {
                stats.cycles_failed += 1;
                stats.last_error = Some(e.to_string());
                drop(stats);
                self.set_state(SyncState::Error);
                warn!(error = %e, "sync cycle aborted");
                Err(e)
            }
        }
    }

    async fn run_cycle(&self, started_at: DateTime<Utc>) -> SyncResult<SyncCycleResult> {
        self.remote.ensure_connected().await?;
        let since = self.pull_since()?;
        debug!(%since, types = self.config.observed.len(), "sync cycle started");

        let mut result = SyncCycleResult::default();
        for observed in &self.config.observed {
            if !observed.push_only {
                self.set_state(SyncState::Pulling);
                self.pull(observed, since, &mut result).await;
            }
            self.set_state(SyncState::Pushing);
            self.push(observed, &mut result);
            self.set_state(SyncState::Pruning);
            self.prune(observed, &mut result);
        }
        self.set_state(SyncState::Pushing);
        self.push_images(&mut result);

        result.success = result.errors.is_empty();
        if result.success {
            self.set_last_sync(started_at)?;
        }
        Ok(result)
    }

    async fn pull(&self, observed: &ObservingType, since: DateTime<Utc>, result: &mut SyncCycleResult) {
        let type_descriptor = observed.type_descriptor.as_str();
        let query = Query::modified_since(since).to_string();
        let page_size = observed.max_items_per_request.max(1);
        let mut skip: u32 = 0;

        while (skip as usize) < observed.max_items_retained {
            let spec = FetchSpec::new(type_descriptor)
                .with_query(query.clone())
                .with_page(page_size, skip)
                .with_include_all(observed.include_relations);
            let page = match self.remote.fetch_page(spec).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(type_descriptor, skip, error = %e, "pull failed");
                    result.errors.push(format!("pull of {type_descriptor} failed: {e}"));
                    return;
                }
            };
            if page.is_empty() {
                break;
            }
            skip = skip.saturating_add(page.len() as u32);

            for remote in page {
                result.pulled += 1;
                let id = remote.id;
                match self.apply_remote(remote, !observed.include_relations) {
                    Ok(ReconcileAction::Insert) => result.inserted += 1,
                    Ok(ReconcileAction::Update) => result.updated += 1,
                    Ok(ReconcileAction::Delete) => result.deleted += 1,
                    Ok(ReconcileAction::Skip) => result.skipped += 1,
                    Err(e) => {
                        let e = SyncError::item(type_descriptor, id, e.to_string());
                        warn!(type_descriptor, entity_id = %id, error = %e, "remote item not applied");
                        result.errors.push(e.to_string());
                    }
                }
            }
        }
        trace!(type_descriptor, fetched = skip, "pull finished");
    }

    fn push(&self, observed: &ObservingType, result: &mut SyncCycleResult) {
        let type_descriptor = observed.type_descriptor.as_str();
        let unsynced = match self.store.get_first(
            type_descriptor,
            usize::MAX,
            0,
            Some(&Query::unsynced()),
            true,
        ) {
            Ok(unsynced) => unsynced,
            Err(e) => {
                warn!(type_descriptor, error = %e, "cannot list unsynced entities");
                result.errors.push(format!("push of {type_descriptor} failed: {e}"));
                return;
            }
        };

        for entity in unsynced {
            let id = entity.id;
            match self.remote.push(WirePackage::command(PackageMethod::Update, entity)) {
                Ok(()) => result.pushed += 1,
                Err(e) => {
                    let e = SyncError::item(type_descriptor, id, e.to_string());
                    warn!(type_descriptor, entity_id = %id, error = %e, "push failed");
                    result.errors.push(e.to_string());
                }
            }
        }
    }

    fn prune(&self, observed: &ObservingType, result: &mut SyncCycleResult) {
        let type_descriptor = observed.type_descriptor.as_str();
        let ids = match self.store.get_ids(type_descriptor, None, usize::MAX) {
            Ok(ids) => ids,
            Err(e) => {
                warn!(type_descriptor, error = %e, "cannot list ids for retention");
                result.errors.push(format!("prune of {type_descriptor} failed: {e}"));
                return;
            }
        };
        let Some(overflow) = ids.get(observed.max_items_retained..) else {
            return;
        };

        for &id in overflow {
            match self.store.delete(type_descriptor, id) {
                Ok(_) => {
                    if let Some(cache) = &self.cache {
                        cache.remove(type_descriptor, id);
                    }
                    result.pruned += 1;
                }
                Err(e) => {
                    let e = SyncError::item(type_descriptor, id, e.to_string());
                    warn!(type_descriptor, entity_id = %id, error = %e, "prune failed");
                    result.errors.push(e.to_string());
                }
            }
        }
        debug!(type_descriptor, pruned = overflow.len(), "retention enforced");
    }

    fn push_images(&self, result: &mut SyncCycleResult) {
        let images = match self.store.unsynced_images() {
            Ok(images) => images,
            Err(e) => {
                warn!(error = %e, "cannot list unsynced images");
                result.errors.push(format!("image push failed: {e}"));
                return;
            }
        };

        for image in images
            .into_iter()
            .filter(|i| self.config.is_observed(&i.related_type))
        {
            let id = image.id;
            let related_type = image.related_type.clone();
            match self
                .remote
                .push(WirePackage::image_command(PackageMethod::Update, image))
            {
                Ok(()) => result.pushed += 1,
                Err(e) => {
                    let e = SyncError::item(related_type, id, e.to_string());
                    warn!(image_id = %id, error = %e, "image push failed");
                    result.errors.push(e.to_string());
                }
            }
        }
    }

    /// Applies one remote entity to the local store, last-write-wins.
    ///
    /// With `keep_local_relations` an update keeps the stored relation set
    /// when the remote copy carries none.
    pub fn apply_remote(&self, remote: Entity, keep_local_relations: bool) -> SyncResult<ReconcileAction> {
        let type_descriptor = remote.type_descriptor.clone();
        let id = remote.id;
        let local = self.store.get_by_id(&type_descriptor, id, true)?;
        let action = reconcile(local.as_ref(), &remote);

        match action {
            ReconcileAction::Insert => {
                let mut entity = self.conform(remote)?;
                entity.synced = true;
                self.store.ensure_schema(&type_descriptor)?;
                self.store.create(&entity)?;
                self.cache_put(entity);
            }
            ReconcileAction::Update => {
                let mut entity = self.conform(remote)?;
                entity.synced = true;
                if keep_local_relations && entity.relations.is_empty() {
                    if let Some(local) = local {
                        entity.relations = local.relations;
                    }
                }
                self.store.update(&entity)?;
                self.cache_put(entity);
            }
            ReconcileAction::Delete => {
                self.store.delete(&type_descriptor, id)?;
                if let Some(cache) = &self.cache {
                    cache.remove(&type_descriptor, id);
                }
            }
            ReconcileAction::Skip => {}
        }
        trace!(type_descriptor, entity_id = %id, ?action, "remote item reconciled");
        Ok(action)
    }

    /// Applies a command another client streamed through the server.
    ///
    /// Returns false if the package carried nothing to apply.
    pub fn apply_streamed(&self, package: &WirePackage) -> SyncResult<bool> {
        let method = package.method.unwrap_or(PackageMethod::Update);
        if let Some(image) = &package.image {
            match method {
                PackageMethod::Delete => {
                    self.store.delete_image(image.id)?;
                }
                PackageMethod::Insert | PackageMethod::Update => {
                    let mut image = image.clone();
                    image.synced = true;
                    self.store.save_image(&image)?;
                }
            }
            return Ok(true);
        }

        let Some(entity) = &package.entity else {
            return Ok(false);
        };
        match method {
            PackageMethod::Delete => {
                self.store.delete(&entity.type_descriptor, entity.id)?;
                if let Some(cache) = &self.cache {
                    cache.remove(&entity.type_descriptor, entity.id);
                }
            }
            PackageMethod::Insert | PackageMethod::Update => {
                self.apply_remote(entity.clone(), true)?;
            }
        }
        Ok(true)
    }

    /// Marks the stored copy of a sent package as synced.
    ///
    /// Nothing happens if the stored copy was edited after the package was
    /// built. Returns true if a record was flipped.
    pub fn acknowledge_sent(&self, package: &WirePackage) -> SyncResult<bool> {
        if package.method == Some(PackageMethod::Delete) {
            return Ok(false);
        }
        if let Some(sent) = &package.image {
            return self.acknowledge_image(sent);
        }
        let Some(sent) = &package.entity else {
            return Ok(false);
        };

        let Some(mut stored) = self.store.get_by_id(&sent.type_descriptor, sent.id, true)? else {
            return Ok(false);
        };
        if stored.synced || stored.modified_at > sent.modified_at {
            return Ok(false);
        }
        stored.synced = true;
        self.store.update(&stored)?;
        self.cache_put(stored);
        trace!(entity_id = %sent.id, "entity acknowledged");
        Ok(true)
    }

    fn acknowledge_image(&self, sent: &ImageAttachment) -> SyncResult<bool> {
        let stored = self
            .store
            .images_for(sent.relation_id)?
            .into_iter()
            .find(|i| i.id == sent.id);
        match stored {
            Some(mut stored) if !stored.synced && stored.modified_at <= sent.modified_at => {
                stored.synced = true;
                self.store.save_image(&stored)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn conform(&self, entity: Entity) -> SyncResult<Entity> {
        match &self.registry {
            Some(registry) if registry.contains(&entity.type_descriptor) => {
                let type_descriptor = entity.type_descriptor.clone();
                Ok(registry.try_cast(&entity, &type_descriptor, true, 1)?)
            }
            _ => Ok(entity),
        }
    }

    fn cache_put(&self, entity: Entity) {
        if let Some(cache) = &self.cache {
            if entity.archived {
                cache.remove(&entity.type_descriptor, entity.id);
            } else {
                cache.add_or_update(entity);
            }
        }
    }
}

impl<R: RemoteAuthority, S: EntityStore + ImageStore + 'static> SyncEngine<R, S> {
    /// Runs cycles on a timer until `shutdown` fires.
    ///
    /// The first cycle starts after the configured delay. A tick that comes
    /// due while a cycle is still running is dropped, never queued.
    pub fn spawn_periodic(self: Arc<Self>, mut shutdown: Shutdown) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.wait() => return,
                _ = tokio::time::sleep(self.config.first_cycle_delay) => {}
            }

            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {}
                }
                match self.sync().await {
                    Ok(result) => trace!(success = result.success, "periodic cycle done"),
                    Err(SyncError::Busy) => {}
                    Err(e) => debug!(error = %e, "periodic cycle failed"),
                }
            }
            debug!("sync timer stopped");
        })
    }
}

impl<R: RemoteAuthority, S: EntityStore + ImageStore + 'static> std::fmt::Debug for SyncEngine<R, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("state", &self.state())
            .field("observed", &self.config.observed.len())
            .field("busy", &self.is_busy())
            .finish_non_exhaustive()
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
