//! The push protocol: land each OCRed document in the repository exactly
//! once.
//!
//! The protocol spans two independent network calls (file upload, then
//! object creation) and is inherently non-transactional. We model it as a
//! saga with a compensating report: an object-creation failure after a
//! successful upload surfaces the orphaned file identifier on an
//! operator-visible channel instead of pretending atomicity. Because the
//! queue delivers at least once, every push starts with an idempotency
//! check against a deterministic dedupe key.

use std::sync::Arc;

use clap::ValueEnum;

use crate::{
    error::{RelayError, RelayResult},
    metadata::{self, FileFieldName},
    ocr::OcrResult,
    prelude::*,
    repository::Repository,
};

/// Which ordering of the two repository calls to use.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PushProtocol {
    /// Upload the file first, then create the object with the real
    /// identifier. The default; the object never references an identifier
    /// that was not returned by a successful upload.
    FileFirst,

    /// Create the object first with an unresolved file reference, then
    /// upload. Legacy only, retained for compatibility; prone to leaving
    /// unresolved attachments.
    NodeFirst,
}

impl std::fmt::Display for PushProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushProtocol::FileFirst => write!(f, "file-first"),
            PushProtocol::NodeFirst => write!(f, "node-first"),
        }
    }
}

/// The result reported back to the caller or bulk-job tracker.
#[derive(Clone, Debug, Serialize)]
pub struct PushReport {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_identifier: Option<i64>,

    pub upload_method: PushProtocol,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PushReport {
    /// Build a failure report from an error.
    pub fn failure(upload_method: PushProtocol, error: &RelayError) -> Self {
        Self {
            success: false,
            object_id: None,
            file_identifier: None,
            upload_method,
            error: Some(error.to_string()),
        }
    }
}

/// Probe for externally requested cancellation, checked between the major
/// phases of a push. Best-effort, not instantaneous.
#[async_trait]
pub trait CancelSignal: Send + Sync {
    async fn is_cancelled(&self) -> bool;
}

/// Cancel signal for pushes that cannot be cancelled (one-shot CLI use).
pub struct NeverCancelled;

#[async_trait]
impl CancelSignal for NeverCancelled {
    async fn is_cancelled(&self) -> bool {
        false
    }
}

/// Publishes OCR results to the repository.
pub struct Synchronizer {
    repository: Arc<dyn Repository>,
}

impl Synchronizer {
    /// Create a synchronizer over the given repository.
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }

    /// Push one OCR result, producing exactly one repository object with
    /// exactly one correctly-referenced file. Repeated pushes of the same
    /// document short-circuit to the existing object.
    #[instrument(level = "debug", skip_all, fields(file = %ocr.file_info.filename, %protocol))]
    pub async fn push(
        &self,
        ocr: &OcrResult,
        collection_id: Option<&str>,
        protocol: PushProtocol,
        cancel: &dyn CancelSignal,
    ) -> RelayResult<PushReport> {
        let key = metadata::dedupe_key(collection_id, &ocr.file_info.filename);
        if let Some(report) = self.check_duplicate(&key, protocol).await? {
            return Ok(report);
        }

        match protocol {
            PushProtocol::FileFirst => self.push_file_first(ocr, collection_id, cancel).await,
            PushProtocol::NodeFirst => self.push_node_first(ocr, collection_id, cancel).await,
        }
    }

    /// Idempotency check: if the object already exists with exactly one
    /// valid file reference, return its reference instead of creating a
    /// second object or appending a duplicate file-reference block.
    async fn check_duplicate(
        &self,
        key: &str,
        protocol: PushProtocol,
    ) -> RelayResult<Option<PushReport>> {
        let Some(existing) = self.repository.find_by_dedupe_key(key).await? else {
            return Ok(None);
        };
        if existing.has_single_valid_reference() {
            info!(
                object_id = existing.object_id,
                "duplicate delivery detected; object already exists"
            );
            return Ok(Some(PushReport {
                success: true,
                object_id: Some(existing.object_id),
                file_identifier: existing.file_identifiers.first().copied(),
                upload_method: protocol,
                error: None,
            }));
        }
        // An object exists but its references are not in the expected
        // one-valid-block shape. Creating a second object is still safer
        // than appending to it.
        warn!(
            object_id = existing.object_id,
            reference_count = existing.file_reference_count,
            "existing object for this document has unexpected file references"
        );
        Ok(None)
    }

    async fn push_file_first(
        &self,
        ocr: &OcrResult,
        collection_id: Option<&str>,
        cancel: &dyn CancelSignal,
    ) -> RelayResult<PushReport> {
        if cancel.is_cancelled().await {
            return Err(RelayError::Cancelled);
        }

        let receipt = self
            .repository
            .upload_file(
                &ocr.file_info.physical_path,
                &ocr.file_info.mime_type,
                None,
            )
            .await?;
        debug!(
            file_identifier = receipt.file_identifier,
            field_name = receipt.field_name.as_str(),
            "file uploaded"
        );

        let mut document = metadata::map(ocr, collection_id);
        document.attach_file(&receipt)?;

        if cancel.is_cancelled().await {
            // The upload already happened; make the orphan visible.
            error!(
                orphaned_file = receipt.file_identifier,
                "cancelled after upload; uploaded file left orphaned"
            );
            return Err(RelayError::Cancelled);
        }

        let created = match self.repository.create_object(&document).await {
            Ok(created) => created,
            Err(e) => {
                error!(
                    orphaned_file = receipt.file_identifier,
                    error = %e,
                    "object creation failed after upload; uploaded file left orphaned"
                );
                return Err(RelayError::ObjectCreate {
                    orphaned_file: receipt.file_identifier,
                    message: e.to_string(),
                });
            }
        };

        info!(
            object_id = created.object_id,
            file_identifier = receipt.file_identifier,
            url = %created.url,
            "document pushed"
        );
        Ok(PushReport {
            success: true,
            object_id: Some(created.object_id),
            file_identifier: Some(receipt.file_identifier),
            upload_method: PushProtocol::FileFirst,
            error: None,
        })
    }

    async fn push_node_first(
        &self,
        ocr: &OcrResult,
        collection_id: Option<&str>,
        cancel: &dyn CancelSignal,
    ) -> RelayResult<PushReport> {
        if cancel.is_cancelled().await {
            return Err(RelayError::Cancelled);
        }

        let mut document = metadata::map(ocr, collection_id);
        document.attach_placeholder(
            ocr.file_info.size,
            &ocr.file_info.mime_type,
            FileFieldName::from_mime(&ocr.file_info.mime_type),
        )?;
        let created = self.repository.create_object(&document).await?;
        debug!(object_id = created.object_id, "object created ahead of upload");

        if cancel.is_cancelled().await {
            warn!(
                object_id = created.object_id,
                "cancelled after object creation; attachment left unresolved"
            );
            return Err(RelayError::Cancelled);
        }

        match self
            .repository
            .upload_file(
                &ocr.file_info.physical_path,
                &ocr.file_info.mime_type,
                Some(created.object_id),
            )
            .await
        {
            Ok(receipt) => {
                info!(
                    object_id = created.object_id,
                    file_identifier = receipt.file_identifier,
                    "document pushed (node-first)"
                );
                Ok(PushReport {
                    success: true,
                    object_id: Some(created.object_id),
                    file_identifier: Some(receipt.file_identifier),
                    upload_method: PushProtocol::NodeFirst,
                    error: None,
                })
            }
            Err(e) => {
                // The block keeps its unresolved tagged state; we never
                // write a numeric sentinel in its place.
                warn!(
                    object_id = created.object_id,
                    error = %e,
                    "follow-up upload failed; attachment left unresolved"
                );
                Err(RelayError::UnresolvedAttachment {
                    object_id: created.object_id,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::{FileInfo, OcrResult};
    use crate::repository::mock::MockRepository;

    struct AlwaysCancelled;

    #[async_trait]
    impl CancelSignal for AlwaysCancelled {
        async fn is_cancelled(&self) -> bool {
            true
        }
    }

    fn sample_ocr() -> OcrResult {
        OcrResult {
            text: "Hello, world.".to_owned(),
            confidence: Some(0.93),
            provider: "tesseract".to_owned(),
            file_info: FileInfo {
                filename: "page1.jpg".to_owned(),
                physical_path: PathBuf::from("/data/newsletters/RSNLVHZZ002/page1.jpg"),
                size: 1024,
                mime_type: "application/pdf".to_owned(),
            },
        }
    }

    fn synchronizer(repo: Arc<MockRepository>) -> Synchronizer {
        Synchronizer::new(repo)
    }

    #[tokio::test]
    async fn file_first_creates_object_with_uploaded_identifier() {
        let repo = Arc::new(MockRepository::new());
        let sync = synchronizer(repo.clone());

        let report = sync
            .push(&sample_ocr(), Some("c1"), PushProtocol::FileFirst, &NeverCancelled)
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.file_identifier, Some(1));
        assert_eq!(report.upload_method, PushProtocol::FileFirst);
        assert_eq!(repo.upload_calls(), 1);
        assert_eq!(repo.create_calls(), 1);

        let documents = repo.created_documents();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0]["documents"], serde_json::json!([1]));
        let blocks = documents[0]["file_references"].as_object().unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks.values().next().unwrap()["file_identifier"], 1);
    }

    #[tokio::test]
    async fn second_push_returns_the_first_object() {
        let repo = Arc::new(MockRepository::new());
        let sync = synchronizer(repo.clone());

        let first = sync
            .push(&sample_ocr(), Some("c1"), PushProtocol::FileFirst, &NeverCancelled)
            .await
            .unwrap();
        let second = sync
            .push(&sample_ocr(), Some("c1"), PushProtocol::FileFirst, &NeverCancelled)
            .await
            .unwrap();

        assert!(second.success);
        assert_eq!(second.object_id, first.object_id);
        assert_eq!(second.file_identifier, first.file_identifier);
        // The duplicate never uploads or creates anything.
        assert_eq!(repo.upload_calls(), 1);
        assert_eq!(repo.create_calls(), 1);
        assert_eq!(repo.object_count(), 1);
    }

    #[tokio::test]
    async fn preseeded_duplicate_short_circuits_before_upload() {
        let repo = Arc::new(
            MockRepository::new().with_existing_object("c1/page1.jpg", 77, vec![456], 1),
        );
        let sync = synchronizer(repo.clone());

        let report = sync
            .push(&sample_ocr(), Some("c1"), PushProtocol::FileFirst, &NeverCancelled)
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.object_id, Some(77));
        assert_eq!(report.file_identifier, Some(456));
        assert_eq!(repo.upload_calls(), 0);
        assert_eq!(repo.create_calls(), 0);
    }

    #[tokio::test]
    async fn upload_failure_aborts_before_any_object_exists() {
        let repo = Arc::new(MockRepository::new().with_upload_failures(1));
        let sync = synchronizer(repo.clone());

        let err = sync
            .push(&sample_ocr(), None, PushProtocol::FileFirst, &NeverCancelled)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Upload { .. }));
        assert!(err.is_transient());
        // The object endpoint received zero calls.
        assert_eq!(repo.create_calls(), 0);
        assert_eq!(repo.object_count(), 0);
    }

    #[tokio::test]
    async fn create_failure_surfaces_the_orphaned_file() {
        let repo = Arc::new(MockRepository::new().with_create_failures(1));
        let sync = synchronizer(repo.clone());

        let err = sync
            .push(&sample_ocr(), None, PushProtocol::FileFirst, &NeverCancelled)
            .await
            .unwrap_err();

        match err {
            RelayError::ObjectCreate { orphaned_file, .. } => assert_eq!(orphaned_file, 1),
            other => panic!("expected ObjectCreate, got {other:?}"),
        }
        assert_eq!(repo.uploaded_ids(), vec![1]);
    }

    #[tokio::test]
    async fn submitted_identifiers_all_came_from_uploads() {
        let repo = Arc::new(MockRepository::new());
        let sync = synchronizer(repo.clone());
        sync.push(&sample_ocr(), Some("c1"), PushProtocol::FileFirst, &NeverCancelled)
            .await
            .unwrap();

        let uploaded = repo.uploaded_ids();
        for document in repo.created_documents() {
            for id in document["documents"].as_array().unwrap() {
                assert!(uploaded.contains(&id.as_i64().unwrap()));
            }
        }
    }

    #[tokio::test]
    async fn cancellation_before_upload_touches_nothing() {
        let repo = Arc::new(MockRepository::new());
        let sync = synchronizer(repo.clone());

        let err = sync
            .push(&sample_ocr(), None, PushProtocol::FileFirst, &AlwaysCancelled)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Cancelled));
        assert_eq!(repo.upload_calls(), 0);
        assert_eq!(repo.create_calls(), 0);
    }

    #[tokio::test]
    async fn node_first_creates_with_unresolved_reference_then_uploads() {
        let repo = Arc::new(MockRepository::new());
        let sync = synchronizer(repo.clone());

        let report = sync
            .push(&sample_ocr(), Some("c1"), PushProtocol::NodeFirst, &NeverCancelled)
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.upload_method, PushProtocol::NodeFirst);
        assert_eq!(report.file_identifier, Some(1));

        let documents = repo.created_documents();
        let blocks = documents[0]["file_references"].as_object().unwrap();
        assert!(blocks.values().next().unwrap()["file_identifier"].is_null());
    }

    #[tokio::test]
    async fn node_first_upload_failure_leaves_the_reference_unresolved() {
        let repo = Arc::new(MockRepository::new().with_upload_failures(1));
        let sync = synchronizer(repo.clone());

        let err = sync
            .push(&sample_ocr(), None, PushProtocol::NodeFirst, &NeverCancelled)
            .await
            .unwrap_err();

        match err {
            RelayError::UnresolvedAttachment { object_id } => assert_eq!(object_id, 1000),
            other => panic!("expected UnresolvedAttachment, got {other:?}"),
        }
        // Held for manual inspection rather than retried into a duplicate.
        assert!(!err.is_transient());
        assert_eq!(repo.object_count(), 1);
    }
}
