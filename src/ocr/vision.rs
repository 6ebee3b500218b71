//! OCR via an OpenAI-compatible vision endpoint (usually a local VLM
//! server, or a hosted vision API behind a proxy).

use std::time::Duration;

use crate::{
    data_url::data_url,
    error::{RelayError, RelayResult},
    prelude::*,
};

use super::{OcrProvider, OcrText};

/// The instruction we send alongside each page image.
const OCR_INSTRUCTION: &str =
    "Transcribe all text in this image exactly as it appears. \
     Output only the transcribed text, with no commentary.";

/// Mime types the vision endpoint accepts as inline images.
const SUPPORTED_IMAGE_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/gif",
    "image/webp",
];

/// OCR provider wrapping an OpenAI-compatible `/chat/completions` endpoint.
pub struct VisionOcrProvider {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    model: String,
    call_timeout: Duration,
}

impl VisionOcrProvider {
    /// Create a new vision provider.
    pub fn new(
        api_base: String,
        api_key: Option<String>,
        model: String,
        call_timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .expect("default TLS backend should be available");
        Self {
            client,
            api_base,
            api_key,
            model,
            call_timeout,
        }
    }

    fn completions_url(&self) -> String {
        let mut url = self.api_base.clone();
        if !url.ends_with('/') {
            url.push('/');
        }
        url.push_str("chat/completions");
        url
    }
}

/// Response shape we care about from `/chat/completions`.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// Error body returned by OpenAI-compatible servers.
#[derive(Debug, Deserialize)]
struct ChatErrorResponse {
    error: ChatErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ChatErrorDetail {
    message: String,
}

#[async_trait]
impl OcrProvider for VisionOcrProvider {
    fn name(&self) -> &str {
        &self.model
    }

    #[instrument(level = "debug", skip_all, fields(model = %self.model, path = %path.display()))]
    async fn process(&self, path: &Path) -> RelayResult<OcrText> {
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_owned();
        if !SUPPORTED_IMAGE_TYPES.contains(&mime_type.as_str()) {
            return Err(RelayError::UnsupportedFormat {
                path: path.to_owned(),
                mime_type,
            });
        }

        let data = tokio::fs::read(path)
            .await
            .map_err(|_| RelayError::FileNotFound {
                path: path.to_owned(),
            })?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": OCR_INSTRUCTION },
                    { "type": "image_url", "image_url": { "url": data_url(&mime_type, &data) } },
                ],
            }],
        });

        let mut request = self.client.post(self.completions_url()).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                RelayError::Timeout {
                    phase: "ocr",
                    timeout: self.call_timeout,
                }
            } else {
                RelayError::Provider {
                    provider: self.model.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            // Try to extract the server's error message; fall back to the
            // bare status.
            let message = match response.json::<ChatErrorResponse>().await {
                Ok(body) => format!("status {}: {}", status, body.error.message),
                Err(_) => format!("status {}", status),
            };
            return Err(RelayError::Provider {
                provider: self.model.clone(),
                message,
            });
        }

        let completion = response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|e| RelayError::Provider {
                provider: self.model.clone(),
                message: format!("failed to parse response: {e}"),
            })?;
        let text = completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| RelayError::Provider {
                provider: self.model.clone(),
                message: "response contained no choices".to_owned(),
            })?;

        // Vision endpoints do not report a confidence score.
        Ok(OcrText {
            text,
            confidence: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_unsupported_formats_before_any_network_call() {
        let provider = VisionOcrProvider::new(
            "http://localhost:9".to_owned(),
            None,
            "test-model".to_owned(),
            Duration::from_secs(1),
        );
        let err = provider.process(Path::new("report.docx")).await.unwrap_err();
        assert!(matches!(err, RelayError::UnsupportedFormat { .. }));
    }
}
