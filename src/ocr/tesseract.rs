//! OCR provider wrapping the `tesseract` CLI tool.

use std::process::Output;

use tokio::process::Command;

use crate::{
    error::{RelayError, RelayResult},
    prelude::*,
};

use super::{OcrProvider, OcrText};

/// OCR provider that shells out to `tesseract`.
#[non_exhaustive]
pub struct TesseractOcrProvider {}

impl TesseractOcrProvider {
    /// Create a new `tesseract` provider.
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for TesseractOcrProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OcrProvider for TesseractOcrProvider {
    fn name(&self) -> &str {
        "tesseract"
    }

    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    async fn process(&self, path: &Path) -> RelayResult<OcrText> {
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_owned();
        if !mime_type.starts_with("image/") {
            return Err(RelayError::UnsupportedFormat {
                path: path.to_owned(),
                mime_type,
            });
        }

        // Tesseract writes `<base>.txt` next to the output base we give it.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract").map_err(|e| {
            RelayError::Provider {
                provider: "tesseract".to_owned(),
                message: format!("cannot create temporary directory: {e}"),
            }
        })?;
        let output_base = tmpdir.path().join("output");

        let output = Command::new("tesseract")
            .arg(path)
            .arg(&output_base)
            .output()
            .await
            .map_err(|e| RelayError::Provider {
                provider: "tesseract".to_owned(),
                message: format!("cannot run tesseract: {e}"),
            })?;
        check_for_command_failure("tesseract", &output)?;

        let text = tokio::fs::read_to_string(output_base.with_extension("txt"))
            .await
            .map_err(|e| RelayError::Provider {
                provider: "tesseract".to_owned(),
                message: format!("cannot read tesseract output: {e}"),
            })?;
        Ok(OcrText {
            text,
            confidence: None,
        })
    }
}

/// Convert a failed command exit into a provider error.
fn check_for_command_failure(name: &str, output: &Output) -> RelayResult<()> {
    if output.status.success() {
        Ok(())
    } else {
        Err(RelayError::Provider {
            provider: name.to_owned(),
            message: format!(
                "{name} failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim(),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_non_image_input() {
        let provider = TesseractOcrProvider::new();
        let err = provider.process(Path::new("scan.pdf")).await.unwrap_err();
        assert!(matches!(err, RelayError::UnsupportedFormat { .. }));
    }
}
