//! The wire package.

use crate::auth::AuthenticationPayload;
use crate::fetch::FetchSpec;
use serde::{Deserialize, Serialize};
use tether_codec::{CodecResult, Decode, Encode};
use tether_model::{Entity, EntityId, ImageAttachment};

/// What a package asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PackageKind {
    /// A query that expects a correlated `FetchResult`.
    Fetch,
    /// The answer to a `Fetch` or `Authenticate`, carrying the request's id.
    FetchResult,
    /// A fire-and-forget mutation.
    Command,
    /// A credential check that expects a correlated answer.
    Authenticate,
}

impl PackageKind {
    /// Returns the numeric code of this kind.
    pub fn type_code(&self) -> u8 {
        match self {
            PackageKind::Fetch => 1,
            PackageKind::FetchResult => 2,
            PackageKind::Command => 3,
            PackageKind::Authenticate => 4,
        }
    }

    /// Returns true if the sender waits for a correlated answer.
    pub fn expects_response(&self) -> bool {
        matches!(self, PackageKind::Fetch | PackageKind::Authenticate)
    }
}

/// The mutation a `Command` performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PackageMethod {
    /// Create a record.
    Insert,
    /// Replace a record.
    Update,
    /// Remove a record.
    Delete,
}

/// One unit of communication between client and server.
///
/// The id doubles as the correlation key: a `FetchResult` answers the
/// request whose id it carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WirePackage {
    /// Package id and correlation key.
    pub id: EntityId,
    /// Package kind.
    pub kind: PackageKind,
    /// Mutation for commands.
    #[serde(default)]
    pub method: Option<PackageMethod>,
    /// Sender's client id, stamped by the client engine.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Credentials or authentication outcome.
    #[serde(default)]
    pub authentication: Option<AuthenticationPayload>,
    /// Entity payload.
    #[serde(default)]
    pub entity: Option<Entity>,
    /// Attachment payload.
    #[serde(default)]
    pub image: Option<ImageAttachment>,
    /// Fetch request and results.
    #[serde(default)]
    pub fetch: Option<FetchSpec>,
}

impl WirePackage {
    /// Creates an empty package of `kind` with a fresh id.
    pub fn new(kind: PackageKind) -> Self {
        Self {
            id: EntityId::new(),
            kind,
            method: None,
            client_id: None,
            authentication: None,
            entity: None,
            image: None,
            fetch: None,
        }
    }

    /// Creates a fetch request.
    pub fn fetch(spec: FetchSpec) -> Self {
        Self {
            fetch: Some(spec),
            ..Self::new(PackageKind::Fetch)
        }
    }

    /// Creates a fetch for the attachments of `owner`.
    pub fn fetch_images(owner: Entity) -> Self {
        Self {
            entity: Some(owner),
            fetch: Some(FetchSpec::new(tether_model::IMAGE_TYPE)),
            ..Self::new(PackageKind::Fetch)
        }
    }

    /// Creates an entity command.
    pub fn command(method: PackageMethod, entity: Entity) -> Self {
        Self {
            method: Some(method),
            entity: Some(entity),
            ..Self::new(PackageKind::Command)
        }
    }

    /// Creates an attachment command.
    pub fn image_command(method: PackageMethod, image: ImageAttachment) -> Self {
        Self {
            method: Some(method),
            image: Some(image),
            ..Self::new(PackageKind::Command)
        }
    }

    /// Creates an authentication request.
    pub fn authenticate(payload: AuthenticationPayload) -> Self {
        Self {
            authentication: Some(payload),
            ..Self::new(PackageKind::Authenticate)
        }
    }

    /// Creates an empty `FetchResult` answering `request`.
    pub fn response_to(request: &WirePackage) -> Self {
        Self {
            id: request.id,
            client_id: request.client_id.clone(),
            ..Self::new(PackageKind::FetchResult)
        }
    }

    /// Sets the client id.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Type descriptor this package concerns, if any.
    pub fn type_descriptor(&self) -> Option<&str> {
        if let Some(spec) = &self.fetch {
            return Some(&spec.type_descriptor);
        }
        if let Some(entity) = &self.entity {
            return Some(&entity.type_descriptor);
        }
        self.image.as_ref().map(|i| i.related_type.as_str())
    }

    /// Encodes to bytes.
    pub fn to_bytes(&self) -> CodecResult<Vec<u8>> {
        self.encode()
    }

    /// Decodes from bytes.
    pub fn from_bytes(bytes: &[u8]) -> CodecResult<Self> {
        Self::decode(bytes)
    }
}
