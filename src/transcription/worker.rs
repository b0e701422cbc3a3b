//! # Transcription Worker Pool
//!
//! Runs [`Transcriber`] calls on tokio's blocking pool, at most
//! `max_concurrent` at a time across all connections. Callers await the
//! outcome from their own task, so a slow transcription never holds up socket
//! I/O or another session.
//!
//! Failures are soft: the outcome carries empty text and the error message.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::transcription::engine::Transcriber;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptOutcome {
    /// Empty when transcription failed or heard nothing
    pub text: String,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct TranscriptionPool {
    transcriber: Arc<dyn Transcriber>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl TranscriptionPool {
    pub fn new(transcriber: Arc<dyn Transcriber>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            transcriber,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.transcriber.name()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Slots not currently running a transcription.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn transcribe(&self, path: PathBuf) -> TranscriptOutcome {
        let started = Instant::now();

        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                return TranscriptOutcome {
                    text: String::new(),
                    elapsed_ms: 0,
                    error: Some(e.to_string()),
                }
            }
        };

        let transcriber = self.transcriber.clone();
        let job_path = path.clone();
        let joined = tokio::task::spawn_blocking(move || transcriber.transcribe(&job_path)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match joined {
            Ok(Ok(text)) => {
                info!(path = %path.display(), elapsed_ms, "transcription finished");
                TranscriptOutcome {
                    text,
                    elapsed_ms,
                    error: None,
                }
            }
            Ok(Err(e)) => {
                warn!(path = %path.display(), error = %e, "transcription failed");
                TranscriptOutcome {
                    text: String::new(),
                    elapsed_ms,
                    error: Some(e.to_string()),
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "transcription task panicked");
                TranscriptOutcome {
                    text: String::new(),
                    elapsed_ms,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}
