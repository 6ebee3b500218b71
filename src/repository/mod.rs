//! The digital repository boundary.
//!
//! The repository is an external collaborator with its own API; we only
//! specify the calls the synchronization protocol needs. The [`Repository`]
//! trait keeps the synchronizer testable without mocking the network.

use uuid::Uuid;

use crate::{
    error::RelayResult,
    metadata::{FileFieldName, MetadataDocument},
    prelude::*,
};

pub mod http;
pub mod mock;
pub mod token;

pub use http::HttpRepository;
pub use token::TokenProvider;

/// What the upload endpoint returns for a successfully stored file.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct UploadReceipt {
    /// The durable file identifier.
    pub file_identifier: i64,

    /// Which array the repository expects this file type to live under.
    pub field_name: FileFieldName,

    /// Stored size in bytes.
    pub size: u64,

    /// Stored mime type.
    pub mime_type: String,
}

/// The object created by the repository. We hold only a reference for
/// reporting; the repository owns the entity.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct CreatedObject {
    pub object_id: i64,
    pub uuid: Uuid,
    pub url: String,
}

/// An existing object found by dedupe key, with enough detail for the
/// idempotency check.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ExistingObject {
    pub object_id: i64,
    pub uuid: Uuid,
    pub url: String,

    /// Resolved file identifiers the object references.
    pub file_identifiers: Vec<i64>,

    /// Total file-reference blocks, including unresolved ones.
    pub file_reference_count: usize,
}

impl ExistingObject {
    /// Does this object already carry exactly one valid file reference?
    pub fn has_single_valid_reference(&self) -> bool {
        self.file_reference_count == 1 && self.file_identifiers.len() == 1
    }
}

/// Interface to the digital repository.
#[async_trait]
pub trait Repository: Send + Sync + 'static {
    /// Look up an object by its deterministic dedupe key.
    async fn find_by_dedupe_key(&self, key: &str) -> RelayResult<Option<ExistingObject>>;

    /// Upload a file, optionally attaching it to an already-created object
    /// (node-first protocol).
    async fn upload_file(
        &self,
        path: &Path,
        mime_type: &str,
        target_object: Option<i64>,
    ) -> RelayResult<UploadReceipt>;

    /// Create a digital object from a metadata document.
    async fn create_object(&self, document: &MetadataDocument) -> RelayResult<CreatedObject>;
}
