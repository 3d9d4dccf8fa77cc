//! Local data service.
//!
//! The application-facing surface: local reads and writes that mirror
//! observed types to the server, server-side reads, attachments and
//! authentication, plus the background sync timer.

use crate::cache::EntityCache;
use crate::client::{ClientEvent, SyncClient};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::state::{SyncCycleResult, SyncEngine};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tether_model::{Entity, EntityId, EntityType, ImageAttachment, TypeRegistry};
use tether_storage::{EntityStore, ImageStore, Query};
use tether_sync_protocol::AuthenticationPayload;
use tether_transport::{shutdown_channel, Shutdown, ShutdownTrigger};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Local store, cache and sync client behind one handle.
///
/// Writes to observed types are stamped, stored, cached and sent to the
/// server as commands. Unobserved types stay local.
pub struct DataService<S: EntityStore + ImageStore + 'static> {
    store: Arc<S>,
    config: SyncConfig,
    registry: Option<Arc<TypeRegistry>>,
    cache: Arc<EntityCache>,
    client: Option<Arc<SyncClient>>,
    engine: Option<Arc<SyncEngine<SyncClient, S>>>,
    trigger: ShutdownTrigger,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: EntityStore + ImageStore + 'static> DataService<S> {
    /// Creates a local-only service.
    pub fn new(store: Arc<S>, config: SyncConfig) -> Self {
        let (trigger, _) = shutdown_channel();
        Self {
            store,
            config,
            registry: None,
            cache: Arc::new(EntityCache::new()),
            client: None,
            engine: None,
            trigger,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Uses `registry` for typed reads and to shape pulled entities.
    pub fn with_registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.registry = Some(registry);
        self.rebuild_engine();
        self
    }

    /// Attaches a sync client.
    pub fn with_client(mut self, client: Arc<SyncClient>) -> Self {
        self.client = Some(client);
        self.rebuild_engine();
        self
    }

    fn rebuild_engine(&mut self) {
        let Some(client) = &self.client else {
            return;
        };
        let mut engine = SyncEngine::new(self.config.clone(), Arc::clone(client), Arc::clone(&self.store))
            .with_cache(Arc::clone(&self.cache));
        if let Some(registry) = &self.registry {
            engine = engine.with_registry(Arc::clone(registry));
        }
        self.engine = Some(Arc::new(engine));
    }

    /// The local store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The entity cache.
    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    /// The sync client, if attached.
    pub fn client(&self) -> Option<&Arc<SyncClient>> {
        self.client.as_ref()
    }

    /// The sync engine, if a client is attached.
    pub fn engine(&self) -> Option<&Arc<SyncEngine<SyncClient, S>>> {
        self.engine.as_ref()
    }

    /// Starts the sync timer and the listener that applies acknowledgements
    /// and streamed commands.
    ///
    /// Does nothing without a client. Calling it twice starts nothing new.
    pub fn start(&self) -> SyncResult<()> {
        if self.trigger.is_triggered() {
            return Err(SyncError::Cancelled);
        }
        let (Some(client), Some(engine)) = (&self.client, &self.engine) else {
            return Ok(());
        };
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }

        tasks.push(tokio::spawn(listen(
            Arc::clone(engine),
            client.subscribe(),
            self.trigger.subscribe(),
        )));
        if !self.config.observed.is_empty() {
            tasks.push(Arc::clone(engine).spawn_periodic(self.trigger.subscribe()));
        }
        info!(observed = self.config.observed.len(), "data service started");
        Ok(())
    }

    /// Stops background work and shuts the client down. Idempotent.
    pub fn shutdown(&self) {
        if self.trigger.is_triggered() {
            return;
        }
        self.trigger.trigger();
        if let Some(client) = &self.client {
            client.shutdown();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        debug!("data service shut down");
    }

    fn is_observed(&self, type_descriptor: &str) -> bool {
        self.config.is_observed(type_descriptor)
    }

    fn mirror(&self, type_descriptor: &str, send: impl FnOnce(&SyncClient) -> SyncResult<()>) {
        if !self.is_observed(type_descriptor) {
            return;
        }
        if let Some(client) = &self.client {
            if let Err(e) = send(client) {
                warn!(type_descriptor, error = %e, "change not sent to server");
            }
        }
    }

    /// Stores a new entity.
    pub fn insert(&self, mut entity: Entity) -> SyncResult<Entity> {
        let now = Utc::now();
        entity.created_at = now;
        entity.modified_at = now;
        entity.synced = false;

        self.store.ensure_schema(&entity.type_descriptor)?;
        self.store.create(&entity)?;
        self.cache.add_or_update(entity.clone());
        self.mirror(&entity.type_descriptor, |c| c.insert(entity.clone()));
        Ok(entity)
    }

    /// Stores a changed entity.
    pub fn update(&self, mut entity: Entity) -> SyncResult<Entity> {
        entity.touch();
        self.store.update(&entity)?;
        self.cache.add_or_update(entity.clone());
        self.mirror(&entity.type_descriptor, |c| c.update(entity.clone()));
        Ok(entity)
    }

    /// Deletes an entity locally; the server archives its copy.
    ///
    /// Returns false if nothing was stored locally.
    pub fn delete(&self, entity: &Entity) -> SyncResult<bool> {
        let deleted = self.store.delete(&entity.type_descriptor, entity.id)?;
        self.cache.remove(&entity.type_descriptor, entity.id);
        self.mirror(&entity.type_descriptor, |c| c.delete(entity.detached()));
        Ok(deleted)
    }

    /// Loads one entity.
    pub fn get_by_id(
        &self,
        type_descriptor: &str,
        id: EntityId,
        include_relations: bool,
    ) -> SyncResult<Option<Entity>> {
        Ok(self.store.get_by_id(type_descriptor, id, include_relations)?)
    }

    /// Loads one entity as `T`.
    ///
    /// Without a registry the stored entity is wrapped as-is.
    pub fn get_typed<T: EntityType>(&self, id: EntityId) -> SyncResult<Option<T>> {
        let Some(entity) = self.store.get_by_id(T::TYPE_NAME, id, true)? else {
            return Ok(None);
        };
        match &self.registry {
            Some(registry) => Ok(Some(T::from_entity(registry.try_cast(
                &entity,
                T::TYPE_NAME,
                true,
                1,
            )?))),
            None => Ok(Some(T::from_entity(entity))),
        }
    }

    /// A page of live entities, newest first.
    pub fn get_page(
        &self,
        type_descriptor: &str,
        take: usize,
        skip: usize,
        include_relations: bool,
    ) -> SyncResult<Vec<Entity>> {
        Ok(self.store.get_first(
            type_descriptor,
            take,
            skip,
            Some(&Query::live()),
            include_relations,
        )?)
    }

    /// Every live entity of a type.
    pub fn get_all(&self, type_descriptor: &str) -> SyncResult<Vec<Entity>> {
        self.get_page(type_descriptor, usize::MAX, 0, false)
    }

    /// At most `take` entities matching `query`.
    pub fn get_by_query(&self, type_descriptor: &str, query: &Query, take: usize) -> SyncResult<Vec<Entity>> {
        Ok(self.store.get_first(type_descriptor, take, 0, Some(query), false)?)
    }

    /// The newest entity matching `query`, if any.
    pub fn get_first_or_default(&self, type_descriptor: &str, query: &Query) -> SyncResult<Option<Entity>> {
        Ok(self.get_by_query(type_descriptor, query, 1)?.into_iter().next())
    }

    /// A page from the cache.
    pub fn get_cached(&self, type_descriptor: &str, take: usize, skip: usize) -> Vec<Entity> {
        self.cache.get(type_descriptor, take, skip)
    }

    /// Fills the cache from the store.
    pub fn warm_cache(&self, type_descriptor: &str, take: usize) -> SyncResult<usize> {
        self.cache.warm(self.store.as_ref(), type_descriptor, take)
    }

    fn connected_client(&self) -> SyncResult<&Arc<SyncClient>> {
        self.client.as_ref().ok_or(SyncError::NotConnected)
    }

    /// Reads entities from the server and merges them into the local store.
    ///
    /// Returns the entities as the server sent them.
    pub async fn get_from_server(
        &self,
        type_descriptor: &str,
        query: Option<&Query>,
        take: u32,
        skip: u32,
        include_all: bool,
    ) -> SyncResult<Vec<Entity>> {
        let client = self.connected_client()?;
        let engine = self.engine.as_ref().ok_or(SyncError::NotConnected)?;
        let entities = client
            .fetch_entities(type_descriptor, query, take, skip, include_all)
            .await?;

        for entity in &entities {
            if let Err(e) = engine.apply_remote(entity.clone(), !include_all) {
                warn!(type_descriptor, entity_id = %entity.id, error = %e, "fetched entity not stored");
            }
        }
        Ok(entities)
    }

    /// Reads ids from the server; `max == 0` means all.
    pub async fn get_ids_from_server(
        &self,
        type_descriptor: &str,
        query: Option<&Query>,
        max: u32,
    ) -> SyncResult<Vec<EntityId>> {
        self.connected_client()?
            .fetch_ids(type_descriptor, query, max)
            .await
    }

    /// Stores an attachment and sends it when its owner type is observed.
    pub fn save_image(&self, mut image: ImageAttachment) -> SyncResult<ImageAttachment> {
        image.modified_at = Utc::now();
        image.synced = false;
        self.store.save_image(&image)?;
        self.mirror(&image.related_type, |c| c.save_image(image.clone()));
        Ok(image)
    }

    /// Deletes an attachment locally and on the server.
    pub fn delete_image(&self, image: &ImageAttachment) -> SyncResult<bool> {
        let deleted = self.store.delete_image(image.id)?;
        self.mirror(&image.related_type, |c| c.delete_image(image.clone()));
        Ok(deleted)
    }

    /// Attachments of `owner` stored locally.
    pub fn images_for(&self, owner: EntityId) -> SyncResult<Vec<ImageAttachment>> {
        Ok(self.store.images_for(owner)?)
    }

    /// Reads the attachments of `owner` from the server and stores them.
    pub async fn fetch_image(&self, owner: &Entity) -> SyncResult<Vec<ImageAttachment>> {
        let mut images = self.connected_client()?.fetch_images(owner).await?;
        for image in &mut images {
            image.synced = true;
            self.store.save_image(image)?;
        }
        Ok(images)
    }

    /// Checks credentials with the server.
    ///
    /// Connection problems come back as a failed payload, not an error.
    pub async fn authenticate(
        &self,
        user_name: &str,
        password: &str,
        target_type: Option<&str>,
    ) -> AuthenticationPayload {
        let Some(client) = &self.client else {
            return AuthenticationPayload::failure(user_name, "no server configured");
        };
        let mut credentials = AuthenticationPayload::credentials(user_name, password);
        if let Some(target_type) = target_type {
            credentials = credentials.with_target_type(target_type);
        }

        let outcome = match client.ensure_connected().await {
            Ok(()) => client.authenticate(credentials).await,
            Err(e) => Err(e),
        };
        outcome.unwrap_or_else(|e| {
            debug!(user_name, error = %e, "authentication request failed");
            AuthenticationPayload::failure(user_name, e.to_string())
        })
    }

    /// Runs one sync cycle now.
    pub async fn sync_now(&self) -> SyncResult<SyncCycleResult> {
        let engine = self.engine.as_ref().ok_or(SyncError::NotConnected)?;
        engine.sync().await
    }
}

impl<S: EntityStore + ImageStore + 'static> Drop for DataService<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<S: EntityStore + ImageStore + 'static> std::fmt::Debug for DataService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataService")
            .field("observed", &self.config.observed.len())
            .field("cached", &self.cache.len())
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

async fn listen<S: EntityStore + ImageStore + 'static>(
    engine: Arc<SyncEngine<SyncClient, S>>,
    mut events: broadcast::Receiver<ClientEvent>,
    mut shutdown: Shutdown,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.wait() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(ClientEvent::PackageSent(package)) => {
                if let Err(e) = engine.acknowledge_sent(&package) {
                    warn!(package_id = %package.id, error = %e, "acknowledgement not stored");
                }
            }
            Ok(ClientEvent::Streaming(package)) => match engine.apply_streamed(&package) {
                Ok(_) => debug!(package_id = %package.id, "streamed change applied"),
                Err(e) => warn!(package_id = %package.id, error = %e, "streamed change not applied"),
            },
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "client events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
