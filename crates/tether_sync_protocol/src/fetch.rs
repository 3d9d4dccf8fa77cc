//! Fetch requests and results.

use serde::{Deserialize, Serialize};
use tether_model::{Entity, EntityId, ImageAttachment};

/// Query half and result half of a fetch exchange.
///
/// The request fields are set by the client; the server fills the result
/// fields (or `result_error`) and sends the spec back.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FetchSpec {
    /// Load full relation graphs.
    #[serde(default)]
    pub include_all: bool,
    /// Predicate text, see `tether_storage::Query`.
    #[serde(default)]
    pub query: Option<String>,
    /// Requested type.
    pub type_descriptor: String,
    /// Page size; 0 means unbounded.
    #[serde(default)]
    pub take: u32,
    /// Page offset.
    #[serde(default)]
    pub skip: u32,
    /// Return ids only.
    #[serde(default)]
    pub id_list_only: bool,
    /// Matching ids (id-list fetches).
    #[serde(default)]
    pub result_ids: Vec<EntityId>,
    /// Matching entities.
    #[serde(default)]
    pub result_entities: Vec<Entity>,
    /// Matching attachments.
    #[serde(default)]
    pub result_images: Vec<ImageAttachment>,
    /// Server-side failure description.
    #[serde(default)]
    pub result_error: Option<String>,
}

impl FetchSpec {
    /// Creates a request for `type_descriptor`.
    pub fn new(type_descriptor: impl Into<String>) -> Self {
        Self {
            type_descriptor: type_descriptor.into(),
            ..Self::default()
        }
    }

    /// Sets the predicate text.
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        self.query = (!query.trim().is_empty()).then_some(query);
        self
    }

    /// Sets the page.
    pub fn with_page(mut self, take: u32, skip: u32) -> Self {
        self.take = take;
        self.skip = skip;
        self
    }

    /// Requests full relation graphs.
    pub fn with_include_all(mut self, include_all: bool) -> Self {
        self.include_all = include_all;
        self
    }

    /// Requests ids only.
    pub fn ids_only(mut self) -> Self {
        self.id_list_only = true;
        self
    }

    /// Clears the result half, keeping the request.
    pub fn request_only(&self) -> Self {
        Self {
            result_ids: Vec::new(),
            result_entities: Vec::new(),
            result_images: Vec::new(),
            result_error: None,
            ..self.clone()
        }
    }

    /// Returns true if the server reported a failure.
    pub fn is_error(&self) -> bool {
        self.result_error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder() {
        let spec = FetchSpec::new("Person")
            .with_query("Synced = false")
            .with_page(50, 100)
            .with_include_all(true);
        assert_eq!(spec.type_descriptor, "Person");
        assert_eq!(spec.query.as_deref(), Some("Synced = false"));
        assert_eq!((spec.take, spec.skip), (50, 100));
        assert!(spec.include_all);
        assert!(!spec.id_list_only);
    }

    #[test]
    fn blank_query_is_none() {
        assert_eq!(FetchSpec::new("Person").with_query("  ").query, None);
    }

    #[test]
    fn request_only_strips_results() {
        let mut spec = FetchSpec::new("Person").ids_only();
        spec.result_ids.push(EntityId::new());
        spec.result_error = Some("boom".into());
        let request = spec.request_only();
        assert!(request.result_ids.is_empty());
        assert!(!request.is_error());
        assert!(request.id_list_only);
    }
}
