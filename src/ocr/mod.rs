//! OCR provider interface.
//!
//! Providers are external and swappable; the pipeline only depends on the
//! [`OcrProvider`] trait. Providers are selected by name, the way engines
//! are selected by model string elsewhere in this codebase's lineage.

use std::sync::Arc;

use crate::{
    config::Config,
    error::{RelayError, RelayResult},
    prelude::*,
};

pub mod mock;
pub mod tesseract;
pub mod vision;

/// What we know about the source file, gathered before OCR.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct FileInfo {
    /// The source filename, without directories.
    pub filename: String,

    /// The resolved physical path.
    pub physical_path: PathBuf,

    /// File size in bytes.
    pub size: u64,

    /// Mime type guessed from the file extension.
    pub mime_type: String,
}

/// The result of OCRing one document. Immutable; consumed once by the
/// metadata mapper.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct OcrResult {
    /// The extracted text.
    pub text: String,

    /// Provider-reported confidence, if any.
    pub confidence: Option<f64>,

    /// Name of the provider that produced the text.
    pub provider: String,

    /// Information about the source file.
    pub file_info: FileInfo,
}

/// Text and confidence as returned by a provider.
#[derive(Clone, Debug)]
pub struct OcrText {
    pub text: String,
    pub confidence: Option<f64>,
}

/// Interface to an OCR provider.
#[async_trait]
pub trait OcrProvider: Send + Sync + 'static {
    /// The provider's name, recorded in the OCR result.
    fn name(&self) -> &str;

    /// Extract text from the file at `path`.
    async fn process(&self, path: &Path) -> RelayResult<OcrText>;
}

/// Get the OCR provider for the specified name.
///
/// `tesseract` runs the local CLI tool; any other name is treated as a
/// vision model served by the configured OpenAI-compatible endpoint.
pub fn provider_for_name(name: &str, config: &Config) -> Arc<dyn OcrProvider> {
    match name {
        "tesseract" => Arc::new(tesseract::TesseractOcrProvider::new()),
        model => Arc::new(vision::VisionOcrProvider::new(
            config.vision_api_base.clone(),
            config.vision_api_key.clone(),
            model.to_owned(),
            config.call_timeout,
        )),
    }
}

/// Run OCR on a resolved physical path and assemble the full result.
///
/// This is where existence is verified: a missing file fails with
/// `FileNotFound` before the provider is invoked.
#[instrument(level = "debug", skip_all, fields(path = %physical_path.display()))]
pub async fn run_ocr(
    provider: &dyn OcrProvider,
    physical_path: &Path,
) -> RelayResult<OcrResult> {
    let metadata = tokio::fs::metadata(physical_path)
        .await
        .map_err(|_| RelayError::FileNotFound {
            path: physical_path.to_owned(),
        })?;
    if !metadata.is_file() {
        return Err(RelayError::FileNotFound {
            path: physical_path.to_owned(),
        });
    }

    let filename = physical_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| RelayError::Internal(format!(
            "path {physical_path:?} has no usable filename"
        )))?
        .to_owned();
    let mime_type = mime_guess::from_path(physical_path)
        .first_or_octet_stream()
        .essence_str()
        .to_owned();

    let ocr_text = provider.process(physical_path).await?;
    debug!(chars = ocr_text.text.len(), "extracted text");

    Ok(OcrResult {
        text: ocr_text.text,
        confidence: ocr_text.confidence,
        provider: provider.name().to_owned(),
        file_info: FileInfo {
            filename,
            physical_path: physical_path.to_owned(),
            size: metadata.len(),
            mime_type,
        },
    })
}
