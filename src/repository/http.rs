//! HTTP client for the digital repository.

use std::time::Duration;

use reqwest::{StatusCode, multipart};
use uuid::Uuid;

use crate::{
    config::Config,
    error::{RelayError, RelayResult},
    metadata::{FileFieldName, MetadataDocument},
    prelude::*,
};

use super::{CreatedObject, ExistingObject, Repository, TokenProvider, UploadReceipt};

/// Repository client speaking the upload and object endpoints over HTTP.
pub struct HttpRepository {
    client: reqwest::Client,
    base_url: String,
    token: TokenProvider,
    call_timeout: Duration,
}

impl HttpRepository {
    /// Create a client for the repository at `base_url`.
    pub fn new(base_url: String, token: TokenProvider, call_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .expect("default TLS backend should be available");
        Self {
            client,
            base_url,
            token,
            call_timeout,
        }
    }

    /// Create a client from process configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let base_url = config.repository_url()?.to_owned();
        let token = TokenProvider::new(
            base_url.clone(),
            config.repository_user.clone(),
            config.repository_password.clone(),
            config.call_timeout,
        );
        Ok(Self::new(base_url, token, config.call_timeout))
    }

    fn url(&self, path: &str) -> String {
        let mut url = self.base_url.clone();
        if !url.ends_with('/') {
            url.push('/');
        }
        url.push_str(path);
        url
    }

    /// Send an authenticated request, refreshing the session token and
    /// retrying once if the repository reports it expired.
    async fn send_with_auth<F>(&self, build: F) -> RelayResult<reqwest::Response>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let token = self.token.token().await?;
        let response = build(&token)
            .send()
            .await
            .map_err(|e| request_error(e, self.call_timeout))?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let token = self.token.refresh(Some(&token)).await?;
            return build(&token)
                .send()
                .await
                .map_err(|e| request_error(e, self.call_timeout));
        }
        Ok(response)
    }
}

/// Convert a reqwest-level failure into our taxonomy. `timeout` is the
/// configured bound, reported so the operator sees what was exceeded.
fn request_error(e: reqwest::Error, timeout: Duration) -> RelayError {
    if e.is_timeout() {
        RelayError::Timeout {
            phase: "repository",
            timeout,
        }
    } else {
        RelayError::Repository(e.to_string())
    }
}

/// Wire shape of a successful upload.
#[derive(Debug, Deserialize)]
struct UploadResponse {
    fid: i64,
    field_name: String,
    size: u64,
    mime_type: String,
}

/// Wire shape of a dedupe-key lookup.
#[derive(Debug, Deserialize)]
struct FindResponse {
    objects: Vec<ObjectSummary>,
}

#[derive(Debug, Deserialize)]
struct ObjectSummary {
    object_id: i64,
    uuid: Uuid,
    url: String,

    /// One entry per file-reference block; `null` for unresolved blocks.
    #[serde(default)]
    file_references: Vec<Option<i64>>,
}

/// Wire shape of a successful object creation.
#[derive(Debug, Deserialize)]
struct CreateResponse {
    object_id: i64,
    uuid: Uuid,
    url: String,
}

#[async_trait]
impl Repository for HttpRepository {
    #[instrument(level = "debug", skip_all, fields(key))]
    async fn find_by_dedupe_key(&self, key: &str) -> RelayResult<Option<ExistingObject>> {
        let response = self
            .send_with_auth(|token| {
                self.client
                    .get(self.url("objects"))
                    .query(&[("dedupe_key", key)])
                    .header("X-CSRF-Token", token)
            })
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(RelayError::Repository(format!(
                "object lookup failed with status {status}"
            )));
        }

        let body = response
            .json::<FindResponse>()
            .await
            .map_err(|e| RelayError::Repository(format!("failed to parse lookup: {e}")))?;
        Ok(body.objects.into_iter().next().map(|o| ExistingObject {
            object_id: o.object_id,
            uuid: o.uuid,
            url: o.url,
            file_identifiers: o.file_references.iter().copied().flatten().collect(),
            file_reference_count: o.file_references.len(),
        }))
    }

    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    async fn upload_file(
        &self,
        path: &Path,
        mime_type: &str,
        target_object: Option<i64>,
    ) -> RelayResult<UploadReceipt> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|_| RelayError::FileNotFound {
                path: path.to_owned(),
            })?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload")
            .to_owned();

        // Validate the mime string once so building the part can't fail.
        multipart::Part::bytes(Vec::new())
            .mime_str(mime_type)
            .map_err(|e| RelayError::Upload {
                message: format!("invalid mime type {mime_type:?}: {e}"),
            })?;

        let response = self
            .send_with_auth(|token| {
                let part = multipart::Part::bytes(data.clone())
                    .file_name(filename.clone())
                    .mime_str(mime_type)
                    .expect("mime type already validated");
                let mut form = multipart::Form::new().part("file", part);
                if let Some(target) = target_object {
                    form = form.text("target_id", target.to_string());
                }
                self.client
                    .post(self.url("file/upload"))
                    .header("X-CSRF-Token", token)
                    .multipart(form)
            })
            .await
            .map_err(|e| match e {
                RelayError::Repository(message) => RelayError::Upload { message },
                other => other,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Upload {
                message: format!("upload failed with status {status}"),
            });
        }
        let body = response
            .json::<UploadResponse>()
            .await
            .map_err(|e| RelayError::Upload {
                message: format!("failed to parse upload response: {e}"),
            })?;
        Ok(UploadReceipt {
            file_identifier: body.fid,
            field_name: FileFieldName::parse(&body.field_name)?,
            size: body.size,
            mime_type: body.mime_type,
        })
    }

    #[instrument(level = "debug", skip_all, fields(dedupe_key = %document.dedupe_key))]
    async fn create_object(&self, document: &MetadataDocument) -> RelayResult<CreatedObject> {
        let payload = document.to_json()?;
        let response = self
            .send_with_auth(|token| {
                self.client
                    .post(self.url("objects"))
                    .header("X-CSRF-Token", token)
                    .json(&payload)
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Repository(format!(
                "object creation failed with status {status}"
            )));
        }
        let body = response
            .json::<CreateResponse>()
            .await
            .map_err(|e| RelayError::Repository(format!("failed to parse creation: {e}")))?;
        Ok(CreatedObject {
            object_id: body.object_id,
            uuid: body.uuid,
            url: body.url,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::Arc;

    use super::*;
    use crate::repository::token::FetchToken;

    struct StaticToken;

    #[async_trait]
    impl FetchToken for StaticToken {
        async fn fetch(&self) -> RelayResult<String> {
            Ok("csrf-token".to_owned())
        }
    }

    #[tokio::test]
    async fn timeouts_report_the_configured_bound() {
        // A listener that accepts connections but never responds, so the
        // request runs into the client timeout rather than a refused
        // connection.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let timeout = Duration::from_millis(50);
        let repo = HttpRepository::new(
            format!("http://{addr}/"),
            TokenProvider::with_fetcher(Arc::new(StaticToken)),
            timeout,
        );
        let err = repo.find_by_dedupe_key("c1/a.pdf").await.unwrap_err();
        let message = err.to_string();
        match err {
            RelayError::Timeout {
                phase,
                timeout: reported,
            } => {
                assert_eq!(phase, "repository");
                assert_eq!(reported, timeout);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert!(message.contains("50ms"), "unexpected message: {message}");
    }
}
