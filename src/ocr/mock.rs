//! Mock OCR provider for deterministic testing.

use std::sync::Mutex;

use crate::{
    error::{RelayError, RelayResult},
    prelude::*,
};

use super::{OcrProvider, OcrText};

/// Mock provider returning fixed text, with optional scripted failures.
pub struct MockOcrProvider {
    text: String,
    confidence: Option<f64>,
    delay: std::time::Duration,
    /// Number of leading calls that should fail transiently.
    failures_remaining: Mutex<u32>,
    call_count: Mutex<u32>,
}

impl MockOcrProvider {
    /// Create a mock provider with default text.
    pub fn new() -> Self {
        Self {
            text: "mock text".to_owned(),
            confidence: Some(0.99),
            delay: std::time::Duration::ZERO,
            failures_remaining: Mutex::new(0),
            call_count: Mutex::new(0),
        }
    }

    /// Set the text returned for every call.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Make every call take `delay` before returning.
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make the first `count` calls fail with a transient provider error.
    pub fn with_transient_failures(self, count: u32) -> Self {
        *self.failures_remaining.lock().expect("lock poisoned") = count;
        self
    }

    /// How many times `process` was called.
    pub fn call_count(&self) -> u32 {
        *self.call_count.lock().expect("lock poisoned")
    }
}

impl Default for MockOcrProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OcrProvider for MockOcrProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn process(&self, _path: &Path) -> RelayResult<OcrText> {
        *self.call_count.lock().expect("lock poisoned") += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut failures = self.failures_remaining.lock().expect("lock poisoned");
        if *failures > 0 {
            *failures -= 1;
            return Err(RelayError::Provider {
                provider: "mock".to_owned(),
                message: "scripted transient failure".to_owned(),
            });
        }
        Ok(OcrText {
            text: self.text.clone(),
            confidence: self.confidence,
        })
    }
}
