//! Mapping OCR results into the repository's metadata shape.
//!
//! This is a pure transformation: same inputs always produce a structurally
//! identical document. The only nondeterminism is the freshly generated UUID
//! keying each file-reference block, which must never be reused.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::{
    error::{RelayError, RelayResult},
    ocr::OcrResult,
    prelude::*,
};

/// Which repository array a file identifier belongs in.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileFieldName {
    Documents,
    Images,
    Videos,
}

impl FileFieldName {
    /// The array name as the repository expects it.
    pub fn as_str(&self) -> &'static str {
        match self {
            FileFieldName::Documents => "documents",
            FileFieldName::Images => "images",
            FileFieldName::Videos => "videos",
        }
    }

    /// Select the target array from a mime type.
    pub fn from_mime(mime_type: &str) -> Self {
        if mime_type.starts_with("image/") {
            FileFieldName::Images
        } else if mime_type.starts_with("video/") {
            FileFieldName::Videos
        } else {
            FileFieldName::Documents
        }
    }

    /// Parse the array name returned by the repository's upload endpoint.
    pub fn parse(name: &str) -> RelayResult<Self> {
        match name {
            "documents" => Ok(FileFieldName::Documents),
            "images" => Ok(FileFieldName::Images),
            "videos" => Ok(FileFieldName::Videos),
            other => Err(RelayError::Internal(format!(
                "unknown file field name {other:?}"
            ))),
        }
    }
}

/// A file identifier in a file-reference block.
///
/// `Unresolved` is an explicit tagged state (serialized as JSON `null`) for
/// an attachment whose upload has not completed. It is distinguishable from
/// every real identifier; we never reuse a numeric identifier as a sentinel.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(from = "Option<i64>", into = "Option<i64>")]
pub enum FileIdentifier {
    Resolved(i64),
    Unresolved,
}

impl From<Option<i64>> for FileIdentifier {
    fn from(value: Option<i64>) -> Self {
        match value {
            Some(id) => FileIdentifier::Resolved(id),
            None => FileIdentifier::Unresolved,
        }
    }
}

impl From<FileIdentifier> for Option<i64> {
    fn from(value: FileIdentifier) -> Self {
        match value {
            FileIdentifier::Resolved(id) => Some(id),
            FileIdentifier::Unresolved => None,
        }
    }
}

/// The nested structure linking one file to a digital object.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct FileReferenceBlock {
    /// The durable identifier returned by the upload endpoint, once known.
    pub file_identifier: FileIdentifier,

    /// Size of the source file in bytes.
    pub file_size: u64,

    /// Mime type of the source file.
    pub mime_type: String,

    /// Which array the identifier belongs in.
    pub field_name: FileFieldName,
}

/// The metadata document sent to the repository's object endpoint.
///
/// Invariant: a document never contains more file-reference blocks than
/// actual uploaded files, and every resolved identifier it carries was
/// returned by a successful upload.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct MetadataDocument {
    /// Human-readable label, taken from the source filename.
    pub label: String,

    /// Deterministic key used for duplicate detection.
    pub dedupe_key: String,

    /// The target collection, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,

    /// The full extracted text.
    pub extracted_text: String,

    /// OCR confidence, when the provider reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr_confidence: Option<f64>,

    /// Which OCR provider produced the text.
    pub ocr_provider: String,

    /// Target arrays (`documents`/`images`/`videos`) holding resolved file
    /// identifiers, flattened into the top level of the document.
    #[serde(flatten)]
    pub files: BTreeMap<String, Vec<i64>>,

    /// File-reference blocks, keyed by a freshly generated UUID.
    pub file_references: BTreeMap<String, FileReferenceBlock>,
}

impl MetadataDocument {
    /// Serialize to the repository's JSON shape.
    pub fn to_json(&self) -> RelayResult<Value> {
        serde_json::to_value(self)
            .map_err(|e| RelayError::Internal(format!("failed to serialize metadata: {e}")))
    }

    /// Inject an uploaded file into the document. This is the single
    /// permitted mutation; a document holds at most one file-reference block.
    pub fn attach_file(&mut self, receipt: &crate::repository::UploadReceipt) -> RelayResult<()> {
        self.insert_block(FileReferenceBlock {
            file_identifier: FileIdentifier::Resolved(receipt.file_identifier),
            file_size: receipt.size,
            mime_type: receipt.mime_type.clone(),
            field_name: receipt.field_name,
        })?;
        self.files
            .insert(receipt.field_name.as_str().to_owned(), vec![receipt.file_identifier]);
        Ok(())
    }

    /// Inject an unresolved file-reference block (node-first protocol only).
    /// No array entry is written because no real identifier exists yet.
    pub fn attach_placeholder(
        &mut self,
        file_size: u64,
        mime_type: &str,
        field_name: FileFieldName,
    ) -> RelayResult<()> {
        self.insert_block(FileReferenceBlock {
            file_identifier: FileIdentifier::Unresolved,
            file_size,
            mime_type: mime_type.to_owned(),
            field_name,
        })
    }

    fn insert_block(&mut self, block: FileReferenceBlock) -> RelayResult<()> {
        if !self.file_references.is_empty() {
            return Err(RelayError::Internal(
                "document already has a file-reference block".to_owned(),
            ));
        }
        self.file_references
            .insert(Uuid::new_v4().to_string(), block);
        Ok(())
    }
}

/// Build the metadata skeleton for an OCR result. No file identifier yet;
/// that is injected by the synchronizer once the upload has succeeded.
pub fn map(ocr: &OcrResult, collection_id: Option<&str>) -> MetadataDocument {
    MetadataDocument {
        label: ocr.file_info.filename.clone(),
        dedupe_key: dedupe_key(collection_id, &ocr.file_info.filename),
        collection_id: collection_id.map(str::to_owned),
        extracted_text: ocr.text.clone(),
        ocr_confidence: ocr.confidence,
        ocr_provider: ocr.provider.clone(),
        files: BTreeMap::new(),
        file_references: BTreeMap::new(),
    }
}

/// Deterministic lookup key derived from source document identity. Both the
/// idempotency check and the created object use this same value; we never
/// rely on queue-level deduplication.
pub fn dedupe_key(collection_id: Option<&str>, filename: &str) -> String {
    format!("{}/{}", collection_id.unwrap_or("default"), filename)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::{FileInfo, OcrResult};
    use crate::repository::UploadReceipt;

    fn sample_ocr() -> OcrResult {
        OcrResult {
            text: "Hello, world.".to_owned(),
            confidence: Some(0.93),
            provider: "tesseract".to_owned(),
            file_info: FileInfo {
                filename: "page1.jpg".to_owned(),
                physical_path: PathBuf::from("/data/newsletters/RSNLVHZZ002/page1.jpg"),
                size: 1024,
                mime_type: "image/jpeg".to_owned(),
            },
        }
    }

    #[test]
    fn field_name_from_mime() {
        assert_eq!(
            FileFieldName::from_mime("application/pdf"),
            FileFieldName::Documents
        );
        assert_eq!(FileFieldName::from_mime("image/jpeg"), FileFieldName::Images);
        assert_eq!(FileFieldName::from_mime("video/mp4"), FileFieldName::Videos);
        assert_eq!(FileFieldName::from_mime("text/plain"), FileFieldName::Documents);
    }

    #[test]
    fn attach_file_populates_array_and_block() {
        let mut doc = map(&sample_ocr(), Some("c1"));
        let receipt = UploadReceipt {
            file_identifier: 456,
            field_name: FileFieldName::Documents,
            size: 1024,
            mime_type: "application/pdf".to_owned(),
        };
        doc.attach_file(&receipt).unwrap();

        assert_eq!(doc.files["documents"], vec![456]);
        assert_eq!(doc.file_references.len(), 1);
        let block = doc.file_references.values().next().unwrap();
        assert_eq!(block.file_identifier, FileIdentifier::Resolved(456));
        assert_eq!(block.field_name, FileFieldName::Documents);
    }

    #[test]
    fn second_attach_is_rejected() {
        let mut doc = map(&sample_ocr(), Some("c1"));
        let receipt = UploadReceipt {
            file_identifier: 1,
            field_name: FileFieldName::Images,
            size: 10,
            mime_type: "image/jpeg".to_owned(),
        };
        doc.attach_file(&receipt).unwrap();
        assert!(doc.attach_file(&receipt).is_err());
        assert_eq!(doc.file_references.len(), 1);
    }

    #[test]
    fn unresolved_identifier_serializes_as_null() {
        let mut doc = map(&sample_ocr(), None);
        doc.attach_placeholder(1024, "image/jpeg", FileFieldName::Images)
            .unwrap();
        let json = doc.to_json().unwrap();
        let block = json["file_references"]
            .as_object()
            .unwrap()
            .values()
            .next()
            .unwrap();
        assert!(block["file_identifier"].is_null());
        // No array entry exists without a real identifier.
        assert!(json.get("images").is_none());
    }

    #[test]
    fn mapping_is_deterministic_apart_from_block_keys() {
        let a = map(&sample_ocr(), Some("c1"));
        let b = map(&sample_ocr(), Some("c1"));
        assert_eq!(a, b);
        assert_eq!(a.dedupe_key, "c1/page1.jpg");
    }

    #[test]
    fn dedupe_key_defaults_the_collection() {
        assert_eq!(dedupe_key(None, "a.pdf"), "default/a.pdf");
        assert_eq!(dedupe_key(Some("c9"), "a.pdf"), "c9/a.pdf");
    }
}
