//! Mock repository for deterministic testing of the push protocol.

use std::sync::Mutex;

use uuid::Uuid;

use crate::{
    error::{RelayError, RelayResult},
    metadata::{FileFieldName, MetadataDocument},
    prelude::*,
};

use super::{CreatedObject, ExistingObject, Repository, UploadReceipt};

/// In-memory repository with a call log and scripted failures.
pub struct MockRepository {
    state: Mutex<MockState>,
}

#[derive(Debug, Default)]
struct MockState {
    next_fid: i64,
    next_object_id: i64,
    objects: Vec<StoredObject>,
    uploaded: Vec<i64>,
    upload_failures: u32,
    create_failures: u32,
    find_calls: u32,
    upload_calls: u32,
    create_calls: u32,
}

#[derive(Debug, Clone)]
struct StoredObject {
    dedupe_key: String,
    existing: ExistingObject,
    document: Option<Value>,
}

impl MockRepository {
    /// Create an empty mock repository.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_fid: 1,
                next_object_id: 1000,
                ..MockState::default()
            }),
        }
    }

    /// Make the first `count` uploads fail.
    pub fn with_upload_failures(self, count: u32) -> Self {
        self.state.lock().expect("lock poisoned").upload_failures = count;
        self
    }

    /// Make the first `count` object creations fail.
    pub fn with_create_failures(self, count: u32) -> Self {
        self.state.lock().expect("lock poisoned").create_failures = count;
        self
    }

    /// Pre-seed an existing object, as if a previous push had created it.
    pub fn with_existing_object(
        self,
        dedupe_key: impl Into<String>,
        object_id: i64,
        file_identifiers: Vec<i64>,
        file_reference_count: usize,
    ) -> Self {
        {
            let mut state = self.state.lock().expect("lock poisoned");
            state.objects.push(StoredObject {
                dedupe_key: dedupe_key.into(),
                existing: ExistingObject {
                    object_id,
                    uuid: Uuid::new_v4(),
                    url: format!("https://repo.test/objects/{object_id}"),
                    file_identifiers,
                    file_reference_count,
                },
                document: None,
            });
        }
        self
    }

    pub fn find_calls(&self) -> u32 {
        self.state.lock().expect("lock poisoned").find_calls
    }

    pub fn upload_calls(&self) -> u32 {
        self.state.lock().expect("lock poisoned").upload_calls
    }

    pub fn create_calls(&self) -> u32 {
        self.state.lock().expect("lock poisoned").create_calls
    }

    /// File identifiers returned by successful uploads, in order.
    pub fn uploaded_ids(&self) -> Vec<i64> {
        self.state.lock().expect("lock poisoned").uploaded.clone()
    }

    /// JSON documents received by the object endpoint, in order.
    pub fn created_documents(&self) -> Vec<Value> {
        self.state
            .lock()
            .expect("lock poisoned")
            .objects
            .iter()
            .filter_map(|o| o.document.clone())
            .collect()
    }

    /// How many objects exist (pre-seeded and created).
    pub fn object_count(&self) -> usize {
        self.state.lock().expect("lock poisoned").objects.len()
    }
}

impl Default for MockRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for MockRepository {
    async fn find_by_dedupe_key(&self, key: &str) -> RelayResult<Option<ExistingObject>> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.find_calls += 1;
        Ok(state
            .objects
            .iter()
            .find(|o| o.dedupe_key == key)
            .map(|o| o.existing.clone()))
    }

    async fn upload_file(
        &self,
        _path: &Path,
        mime_type: &str,
        _target_object: Option<i64>,
    ) -> RelayResult<UploadReceipt> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.upload_calls += 1;
        if state.upload_failures > 0 {
            state.upload_failures -= 1;
            return Err(RelayError::Upload {
                message: "scripted upload failure".to_owned(),
            });
        }
        let fid = state.next_fid;
        state.next_fid += 1;
        state.uploaded.push(fid);
        Ok(UploadReceipt {
            file_identifier: fid,
            field_name: FileFieldName::from_mime(mime_type),
            size: 1024,
            mime_type: mime_type.to_owned(),
        })
    }

    async fn create_object(&self, document: &MetadataDocument) -> RelayResult<CreatedObject> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.create_calls += 1;
        if state.create_failures > 0 {
            state.create_failures -= 1;
            return Err(RelayError::Repository(
                "scripted creation failure".to_owned(),
            ));
        }
        let object_id = state.next_object_id;
        state.next_object_id += 1;
        let created = CreatedObject {
            object_id,
            uuid: Uuid::new_v4(),
            url: format!("https://repo.test/objects/{object_id}"),
        };
        state.objects.push(StoredObject {
            dedupe_key: document.dedupe_key.clone(),
            existing: ExistingObject {
                object_id,
                uuid: created.uuid,
                url: created.url.clone(),
                file_identifiers: document.files.values().flatten().copied().collect(),
                file_reference_count: document.file_references.len(),
            },
            document: Some(document.to_json()?),
        });
        Ok(created)
    }
}
