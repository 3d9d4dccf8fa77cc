//! Request resolution for inbound packages.

use crate::auth::Authenticator;
use crate::error::{ServerError, ServerResult};
use chrono::Utc;
use std::sync::Arc;
use tether_model::{Entity, IMAGE_TYPE};
use tether_storage::{EntityStore, ImageStore, Query};
use tether_sync_protocol::{AuthenticationPayload, FetchSpec, PackageMethod, WirePackage};
use tracing::{debug, warn};

/// Answers the three kinds of work a connection handler receives.
///
/// Resolvers are synchronous; the server runs them off the I/O threads.
pub trait RequestResolver: Send + Sync + 'static {
    /// Resolves a `Fetch` package into the result half of its spec.
    ///
    /// Failures are reported through `FetchSpec::result_error`.
    fn resolve_fetch(&self, request: &WirePackage) -> FetchSpec;

    /// Checks credentials.
    fn authenticate(&self, request: &AuthenticationPayload) -> AuthenticationPayload;

    /// Applies a streamed insert, update or delete.
    fn apply_stream(&self, package: &WirePackage) -> ServerResult<()>;
}

/// Resolver backed by an entity and image store.
pub struct StoreResolver<S> {
    store: Arc<S>,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl<S> StoreResolver<S>
where
    S: EntityStore + ImageStore + 'static,
{
    /// Creates a resolver over `store` that rejects every login.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            authenticator: None,
        }
    }

    /// Sets the authenticator.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn fetch_into(&self, request: &WirePackage, spec: &FetchSpec, out: &mut FetchSpec) -> ServerResult<()> {
        let query = spec.query.as_deref().map(Query::parse).transpose()?;
        let type_descriptor = spec.type_descriptor.as_str();

        if type_descriptor == IMAGE_TYPE {
            let owner = request.entity.as_ref().ok_or_else(|| {
                ServerError::InvalidRequest("image fetch without an owning entity".into())
            })?;
            out.result_images = self.store.images_for(owner.id)?;
        } else if spec.id_list_only {
            let max = match spec.take {
                0 => usize::MAX,
                take => take as usize,
            };
            out.result_ids = self.store.get_ids(type_descriptor, query.as_ref(), max)?;
        } else {
            let take = match spec.take {
                0 => usize::MAX,
                take => take as usize,
            };
            out.result_entities = self.store.get_first(
                type_descriptor,
                take,
                spec.skip as usize,
                query.as_ref(),
                spec.include_all,
            )?;
        }
        Ok(())
    }

    fn apply_entity(&self, method: PackageMethod, entity: &Entity) -> ServerResult<()> {
        let type_descriptor = entity.type_descriptor.as_str();
        self.store.ensure_schema(type_descriptor)?;
        let stored = self.store.get_by_id(type_descriptor, entity.id, false)?;

        let mut incoming = entity.clone();
        incoming.synced = true;

        match (method, stored) {
            (PackageMethod::Delete, Some(mut current)) => {
                current.archived = true;
                current.modified_at = Utc::now().max(current.modified_at);
                current.synced = true;
                self.store.update(&current)?;
            }
            (PackageMethod::Delete, None) => {
                debug!(type_descriptor, id = %entity.id, "delete for unknown entity ignored");
            }
            (_, None) => self.store.create(&incoming)?,
            (_, Some(current)) if current.modified_at > incoming.modified_at => {
                debug!(
                    type_descriptor,
                    id = %entity.id,
                    "stored version is newer, update skipped"
                );
            }
            (_, Some(_)) => self.store.update(&incoming)?,
        }
        Ok(())
    }
}

impl<S> RequestResolver for StoreResolver<S>
where
    S: EntityStore + ImageStore + 'static,
{
    fn resolve_fetch(&self, request: &WirePackage) -> FetchSpec {
        let Some(spec) = request.fetch.as_ref() else {
            return FetchSpec {
                result_error: Some("fetch package carries no fetch spec".into()),
                ..FetchSpec::default()
            };
        };

        let mut response = spec.request_only();
        if let Err(e) = self.fetch_into(request, spec, &mut response) {
            warn!(
                type_descriptor = %spec.type_descriptor,
                package_id = %request.id,
                error = %e,
                "fetch failed"
            );
            response.result_error = Some(e.to_string());
        }
        response
    }

    fn authenticate(&self, request: &AuthenticationPayload) -> AuthenticationPayload {
        match &self.authenticator {
            Some(authenticator) => authenticator.authenticate(request),
            None => AuthenticationPayload::failure(
                request.user_name.clone(),
                "authentication is not configured",
            ),
        }
    }

    fn apply_stream(&self, package: &WirePackage) -> ServerResult<()> {
        let method = package
            .method
            .ok_or_else(|| ServerError::InvalidRequest("streamed package without method".into()))?;

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
            return Ok(());
        }

        let entity = package
            .entity
            .as_ref()
            .ok_or_else(|| ServerError::InvalidRequest("streamed package without payload".into()))?;
        self.apply_entity(method, entity)
    }
}

impl<S> std::fmt::Debug for StoreResolver<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreResolver")
            .field("authenticator", &self.authenticator.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthConfig, CredentialAuthenticator};
    use chrono::Duration;
    use proptest::prelude::*;
    use tether_model::{EntityId, ImageAttachment};
    use tether_storage::InMemoryStore;
    use tether_sync_protocol::PackageKind;

    fn resolver() -> StoreResolver<InMemoryStore> {
        StoreResolver::new(Arc::new(InMemoryStore::new()))
    }

    fn person(name: &str) -> Entity {
        Entity::new("Person").with("Name", name)
    }

    fn seed(resolver: &StoreResolver<InMemoryStore>, count: usize) -> Vec<Entity> {
        (0..count)
            .map(|i| {
                let mut entity = person(&format!("p{i}"));
                entity.created_at = entity.created_at + Duration::seconds(i as i64);
                resolver.store().create(&entity).unwrap();
                entity
            })
            .collect()
    }

    fn fetch(spec: FetchSpec) -> WirePackage {
        WirePackage::fetch(spec)
    }

    #[test]
    fn fetch_page() {
        let resolver = resolver();
        seed(&resolver, 5);
        let result = resolver.resolve_fetch(&fetch(FetchSpec::new("Person").with_page(2, 1)));
        assert!(!result.is_error());
        assert_eq!(result.result_entities.len(), 2);
        assert_eq!(result.result_entities[0].text("Name"), Some("p3"));
    }

    #[test]
    fn fetch_all_when_take_is_zero() {
        let resolver = resolver();
        seed(&resolver, 7);
        let result = resolver.resolve_fetch(&fetch(FetchSpec::new("Person")));
        assert_eq!(result.result_entities.len(), 7);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn pages_never_exceed_what_is_left(count in 0usize..12, take in 0u32..15, skip in 0u32..15) {
            let resolver = resolver();
            seed(&resolver, count);
            let result = resolver.resolve_fetch(&fetch(FetchSpec::new("Person").with_page(take, skip)));

            let left = count.saturating_sub(skip as usize);
            let expected = if take == 0 { left } else { left.min(take as usize) };
            prop_assert!(!result.is_error());
            prop_assert_eq!(result.result_entities.len(), expected);

            let ids = resolver.resolve_fetch(&fetch(FetchSpec::new("Person").with_page(take, 0).ids_only()));
            let expected = if take == 0 { count } else { count.min(take as usize) };
            prop_assert_eq!(ids.result_ids.len(), expected);
        }
    }

    #[test]
    fn fetch_ids_with_query() {
        let resolver = resolver();
        let seeded = seed(&resolver, 3);
        let result = resolver.resolve_fetch(&fetch(
            FetchSpec::new("Person").with_query("Name = 'p1'").ids_only(),
        ));
        assert_eq!(result.result_ids, vec![seeded[1].id]);
        assert!(result.result_entities.is_empty());
    }

    #[test]
    fn bad_query_is_reported_in_result() {
        let resolver = resolver();
        let result = resolver.resolve_fetch(&fetch(FetchSpec::new("Person").with_query("Name ~ 1")));
        assert!(result.is_error());
        assert_eq!(result.type_descriptor, "Person");
    }

    #[test]
    fn missing_spec_is_reported() {
        let result = resolver().resolve_fetch(&WirePackage::new(PackageKind::Fetch));
        assert!(result.is_error());
    }

    #[test]
    fn fetch_images_for_owner() {
        let resolver = resolver();
        let owner = person("ada");
        let image = ImageAttachment::new(owner.id, "Person", vec![1, 2, 3]);
        resolver.store().save_image(&image).unwrap();
        resolver
            .store()
            .save_image(&ImageAttachment::new(EntityId::new(), "Person", vec![9]))
            .unwrap();

        let result = resolver.resolve_fetch(&WirePackage::fetch_images(owner));
        assert_eq!(result.result_images.len(), 1);
        assert_eq!(result.result_images[0].id, image.id);
    }

    #[test]
    fn streamed_insert_then_update() {
        let resolver = resolver();
        let mut entity = person("ada");
        resolver
            .apply_stream(&WirePackage::command(PackageMethod::Insert, entity.clone()))
            .unwrap();

        entity.set("Name", "Ada Lovelace");
        entity.touch();
        resolver
            .apply_stream(&WirePackage::command(PackageMethod::Update, entity.clone()))
            .unwrap();

        let stored = resolver.store().get_by_id("Person", entity.id, false).unwrap().unwrap();
        assert_eq!(stored.text("Name"), Some("Ada Lovelace"));
        assert!(stored.synced);
    }

    #[test]
    fn stale_update_is_skipped() {
        let resolver = resolver();
        let current = person("new");
        resolver.store().create(&current).unwrap();

        let mut stale = current.clone();
        stale.set("Name", "old");
        stale.modified_at = current.modified_at - Duration::minutes(5);
        resolver
            .apply_stream(&WirePackage::command(PackageMethod::Update, stale))
            .unwrap();

        let stored = resolver.store().get_by_id("Person", current.id, false).unwrap().unwrap();
        assert_eq!(stored.text("Name"), Some("new"));
    }

    #[test]
    fn delete_archives() {
        let resolver = resolver();
        let entity = person("ada");
        resolver.store().create(&entity).unwrap();

        resolver
            .apply_stream(&WirePackage::command(PackageMethod::Delete, entity.clone()))
            .unwrap();

        let stored = resolver.store().get_by_id("Person", entity.id, false).unwrap().unwrap();
        assert!(stored.archived);
        assert!(stored.modified_at >= entity.modified_at);
    }

    #[test]
    fn streamed_images() {
        let resolver = resolver();
        let image = ImageAttachment::new(EntityId::new(), "Person", vec![7; 16]);
        resolver
            .apply_stream(&WirePackage::image_command(PackageMethod::Insert, image.clone()))
            .unwrap();
        let stored = resolver.store().images_for(image.relation_id).unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].synced);

        resolver
            .apply_stream(&WirePackage::image_command(PackageMethod::Delete, image.clone()))
            .unwrap();
        assert!(resolver.store().images_for(image.relation_id).unwrap().is_empty());
    }

    #[test]
    fn stream_without_payload_is_rejected() {
        let mut package = WirePackage::new(PackageKind::Command);
        package.method = Some(PackageMethod::Insert);
        assert!(matches!(
            resolver().apply_stream(&package),
            Err(ServerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn authentication_delegates() {
        let plain = resolver();
        assert!(!plain.authenticate(&AuthenticationPayload::credentials("ada", "x")).success);

        let auth = CredentialAuthenticator::new(AuthConfig::new(b"k".to_vec()))
            .with_user("ada", "lovelace");
        let with_auth = resolver().with_authenticator(Arc::new(auth));
        assert!(
            with_auth
                .authenticate(&AuthenticationPayload::credentials("ada", "lovelace"))
                .success
        );
    }
}
