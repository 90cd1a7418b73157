//! Chunked file transfer
//!
//! Pushes a binary payload to a terminal as `upload_file_init`, a strictly
//! sequential run of acknowledged `upload_file_chunk` requests, and a final
//! `upload_file_complete`. A chunk is re-sent unchanged after a failure until
//! the retry bound is hit, at which point the whole transfer fails; nothing
//! already delivered is rolled back.
//!
//! [`TransferSession`] is the pure state machine; [`TransferEngine`] drives
//! it over a [`Multiplexer`].

use core::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::{smallvec, SmallVec};
use tracing::{debug, info, warn};

use crate::commands::ControlModule;
use crate::config::TransferConfig;
use crate::errors::{ControlError, Result};
use crate::multiplexer::Multiplexer;
use crate::protocol::{ControlResponse, FileChunkPayload, FileCompletePayload, FileInitPayload};
use crate::types::DeviceTarget;

// ----------------------------------------------------------------------------
// Transfer Types
// ----------------------------------------------------------------------------

/// A file queued for transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFile {
    /// File name announced to the terminal
    pub name: String,
    /// Declared file type (e.g. `acu`, `adu`)
    pub file_type: String,
    /// File contents
    pub data: Vec<u8>,
}

impl TransferFile {
    pub fn new(name: impl Into<String>, file_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            file_type: file_type.into(),
            data,
        }
    }
}

/// Generate a transfer identifier as `file-<unix millis>-<0..9999>-<name>`
pub fn generate_file_id(file_name: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    let salt: u16 = rand::thread_rng().gen_range(0..10_000);
    format!("file-{}-{}-{}", millis, salt, file_name)
}

/// State of a transfer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    /// Waiting for the init acknowledgment
    Init,
    /// Waiting for the first acknowledgment of a chunk
    Sending { chunk_index: u32 },
    /// A chunk failed and was re-sent
    RetryingChunk { chunk_index: u32, attempt: u32 },
    /// Waiting for the completion acknowledgment
    Completing,
    Completed,
    Failed,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Sending { chunk_index } => write!(f, "sending chunk {}", chunk_index),
            Self::RetryingChunk {
                chunk_index,
                attempt,
            } => write!(f, "retrying chunk {} (attempt {})", chunk_index, attempt),
            Self::Completing => write!(f, "completing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Summary of a finished transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReport {
    pub file_id: String,
    pub file_name: String,
    pub total_size: u64,
    pub total_chunks: u32,
    /// Chunk re-sends over the whole transfer
    pub retries: u32,
}

/// Notifications emitted while a transfer runs
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Started {
        file_id: String,
        total_size: u64,
        total_chunks: u32,
    },
    /// A chunk was acknowledged
    Progress { chunk_index: u32, percent: u8 },
    /// A chunk failed and is being re-sent
    ChunkRetry {
        chunk_index: u32,
        attempt: u32,
        reason: String,
    },
    /// Terminal: the completion notice was acknowledged
    Completed(TransferReport),
    /// Terminal: the transfer was abandoned
    Failed(ControlError),
}

impl TransferEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }
}

/// A request the session wants sent next
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub module: ControlModule,
    pub payload: Value,
}

/// Outcome of feeding the session one input
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransferStep {
    /// Events to report, in order
    pub events: SmallVec<[TransferEvent; 2]>,
    /// Next request to send; None once the session is terminal
    pub request: Option<TransferRequest>,
}

// ----------------------------------------------------------------------------
// Transfer Session
// ----------------------------------------------------------------------------

/// State machine for one chunked transfer
#[derive(Debug)]
pub struct TransferSession {
    file_id: String,
    file: TransferFile,
    chunk_size: usize,
    total_chunks: u32,
    max_retries: u32,
    retries: u32,
    total_retries: u32,
    state: TransferState,
    started: bool,
    failure: Option<ControlError>,
}

impl TransferSession {
    /// Create a session for `file` under `file_id`
    pub fn new(file_id: impl Into<String>, file: TransferFile, config: TransferConfig) -> Result<Self> {
        config.validate()?;
        let total_chunks = u32::try_from(file.data.len().div_ceil(config.chunk_size_bytes))
            .map_err(|_| {
                ControlError::Configuration(format!(
                    "{} needs more than {} chunks",
                    file.name,
                    u32::MAX
                ))
            })?;

        Ok(Self {
            file_id: file_id.into(),
            file,
            chunk_size: config.chunk_size_bytes,
            total_chunks,
            max_retries: config.max_chunk_retries,
            retries: 0,
            total_retries: 0,
            state: TransferState::Init,
            started: false,
            failure: None,
        })
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn total_size(&self) -> u64 {
        self.file.data.len() as u64
    }

    /// Emit `Started` and the init request
    pub fn start(&mut self) -> TransferStep {
        if self.started {
            warn!("Transfer {} already started", self.file_id);
            return TransferStep::default();
        }
        self.started = true;

        info!(
            "Starting transfer {} ({} bytes in {} chunks)",
            self.file_id,
            self.total_size(),
            self.total_chunks
        );
        let payload = FileInitPayload {
            file_id: self.file_id.clone(),
            file_name: self.file.name.clone(),
            file_type: self.file.file_type.clone(),
            total_size: self.total_size(),
            total_chunks: self.total_chunks,
        };
        TransferStep {
            events: smallvec![TransferEvent::Started {
                file_id: self.file_id.clone(),
                total_size: self.total_size(),
                total_chunks: self.total_chunks,
            }],
            request: Some(self.request(ControlModule::UploadFileInit, &payload)),
        }
    }

    /// Feed the outcome of the last request
    pub fn on_response(&mut self, outcome: Result<ControlResponse>) -> TransferStep {
        let acknowledged = match outcome {
            Ok(response) if response.is_terminal_success() => Ok(response),
            Ok(response) => Err(response.error_message()),
            Err(err) => Err(err.to_string()),
        };

        match (self.state, acknowledged) {
            (TransferState::Init, Ok(_)) => {
                debug!("Transfer {} accepted by terminal", self.file_id);
                if self.total_chunks == 0 {
                    self.begin_completion(SmallVec::new())
                } else {
                    self.send_chunk(0, SmallVec::new())
                }
            }
            (TransferState::Init, Err(reason)) => self.fail(ControlError::InitFailure { reason }),

            (TransferState::Sending { chunk_index }, Ok(response))
            | (TransferState::RetryingChunk { chunk_index, .. }, Ok(response)) => {
                self.retries = 0;
                let percent = response
                    .progress()
                    .unwrap_or_else(|| self.computed_progress(chunk_index));
                let events = smallvec![TransferEvent::Progress {
                    chunk_index,
                    percent,
                }];
                let next = chunk_index + 1;
                if next >= self.total_chunks {
                    self.begin_completion(events)
                } else {
                    self.send_chunk(next, events)
                }
            }
            (TransferState::Sending { chunk_index }, Err(reason))
            | (TransferState::RetryingChunk { chunk_index, .. }, Err(reason)) => {
                self.retries += 1;
                if self.retries >= self.max_retries {
                    return self.fail(ControlError::ChunkRetryExhausted {
                        chunk_index,
                        attempts: self.retries,
                    });
                }

                self.total_retries += 1;
                warn!(
                    "Chunk {} of {} failed ({}), retry {}/{}",
                    chunk_index, self.file_id, reason, self.retries, self.max_retries
                );
                let events = smallvec![TransferEvent::ChunkRetry {
                    chunk_index,
                    attempt: self.retries,
                    reason,
                }];
                let step = self.send_chunk(chunk_index, events);
                self.state = TransferState::RetryingChunk {
                    chunk_index,
                    attempt: self.retries,
                };
                step
            }

            (TransferState::Completing, Ok(_)) => {
                self.state = TransferState::Completed;
                let report = self.report();
                info!(
                    "Transfer {} completed ({} retries)",
                    self.file_id, report.retries
                );
                TransferStep {
                    events: smallvec![TransferEvent::Completed(report)],
                    request: None,
                }
            }
            (TransferState::Completing, Err(reason)) => {
                self.fail(ControlError::CompletionFailure { reason })
            }

            (state @ (TransferState::Completed | TransferState::Failed), _) => {
                warn!(
                    "Ignoring response for transfer {} in state {}",
                    self.file_id, state
                );
                TransferStep::default()
            }
        }
    }

    /// Final outcome; an error if the session has not finished
    pub fn finish(self) -> Result<TransferReport> {
        match self.state {
            TransferState::Completed => Ok(self.report()),
            TransferState::Failed => Err(self.failure.unwrap_or_else(|| {
                ControlError::CompletionFailure {
                    reason: "transfer failed".to_string(),
                }
            })),
            state => Err(ControlError::CompletionFailure {
                reason: format!("transfer stopped while {}", state),
            }),
        }
    }

    fn send_chunk(
        &mut self,
        chunk_index: u32,
        events: SmallVec<[TransferEvent; 2]>,
    ) -> TransferStep {
        let start = chunk_index as usize * self.chunk_size;
        let end = (start + self.chunk_size).min(self.file.data.len());
        let payload = FileChunkPayload {
            file_id: self.file_id.clone(),
            chunk_index,
            chunk_data: STANDARD.encode(&self.file.data[start..end]),
        };
        self.state = TransferState::Sending { chunk_index };
        TransferStep {
            events,
            request: Some(self.request(ControlModule::UploadFileChunk, &payload)),
        }
    }

    fn begin_completion(&mut self, events: SmallVec<[TransferEvent; 2]>) -> TransferStep {
        self.state = TransferState::Completing;
        let payload = FileCompletePayload {
            file_id: self.file_id.clone(),
        };
        TransferStep {
            events,
            request: Some(self.request(ControlModule::UploadFileComplete, &payload)),
        }
    }

    fn fail(&mut self, error: ControlError) -> TransferStep {
        warn!("Transfer {} failed: {}", self.file_id, error);
        self.state = TransferState::Failed;
        self.failure = Some(error.clone());
        TransferStep {
            events: smallvec![TransferEvent::Failed(error)],
            request: None,
        }
    }

    fn request<T: Serialize>(&self, module: ControlModule, payload: &T) -> TransferRequest {
        TransferRequest {
            module,
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
        }
    }

    fn computed_progress(&self, chunk_index: u32) -> u8 {
        let done = u64::from(chunk_index) + 1;
        let total = u64::from(self.total_chunks.max(1));
        ((done * 100).div_ceil(total)).min(100) as u8
    }

    fn report(&self) -> TransferReport {
        TransferReport {
            file_id: self.file_id.clone(),
            file_name: self.file.name.clone(),
            total_size: self.total_size(),
            total_chunks: self.total_chunks,
            retries: self.total_retries,
        }
    }
}

// ----------------------------------------------------------------------------
// Transfer Engine
// ----------------------------------------------------------------------------

/// Runs transfer sessions over the multiplexer
pub struct TransferEngine {
    multiplexer: Arc<Multiplexer>,
    config: TransferConfig,
}

impl TransferEngine {
    pub fn new(multiplexer: Arc<Multiplexer>, config: TransferConfig) -> Self {
        Self {
            multiplexer,
            config,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Push `file` to `target`, reporting every event to `observer`
    ///
    /// The observer sees exactly one terminal event, and the return value
    /// mirrors it.
    pub async fn upload<F>(
        &self,
        target: &DeviceTarget,
        file: TransferFile,
        mut observer: F,
    ) -> Result<TransferReport>
    where
        F: FnMut(&TransferEvent),
    {
        target.validate()?;
        let file_id = generate_file_id(&file.name);
        let mut session = TransferSession::new(file_id, file, self.config)?;

        let mut step = session.start();
        loop {
            for event in &step.events {
                observer(event);
            }
            let Some(request) = step.request.take() else {
                break;
            };
            let outcome = match self
                .multiplexer
                .call(request.module.as_str(), request.payload, target)
            {
                Ok(pending) => pending.await,
                Err(err) => Err(err),
            };
            step = session.on_response(outcome);
        }

        session.finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session(size: usize) -> TransferSession {
        let data = (0..size).map(|i| (i % 251) as u8).collect();
        TransferSession::new(
            "file-1-1-acu.bin",
            TransferFile::new("acu.bin", "acu", data),
            TransferConfig {
                chunk_size_bytes: 1024,
                max_chunk_retries: 3,
            },
        )
        .unwrap()
    }

    fn ack(module: ControlModule) -> Result<ControlResponse> {
        Ok(ControlResponse::ok(module.as_str(), json!({})))
    }

    fn nack(module: ControlModule) -> Result<ControlResponse> {
        Ok(ControlResponse::failed(module.as_str(), "crc mismatch"))
    }

    fn chunk_index(step: &TransferStep) -> u64 {
        step.request.as_ref().unwrap().payload["chunkIndex"]
            .as_u64()
            .unwrap()
    }

    #[test]
    fn test_chunk_count_rounds_up() {
        assert_eq!(session(2500).total_chunks(), 3);
        assert_eq!(session(2048).total_chunks(), 2);
        assert_eq!(session(0).total_chunks(), 0);
    }

    #[test]
    fn test_init_request_shape() {
        let mut session = session(2500);
        let step = session.start();
        let request = step.request.unwrap();
        assert_eq!(request.module, ControlModule::UploadFileInit);
        assert_eq!(
            request.payload,
            json!({
                "fileId": "file-1-1-acu.bin",
                "fileName": "acu.bin",
                "fileType": "acu",
                "totalSize": 2500,
                "totalChunks": 3
            })
        );
        assert!(matches!(step.events[0], TransferEvent::Started { .. }));
    }

    #[test]
    fn test_last_chunk_is_short() {
        let mut session = session(2500);
        session.start();
        session.on_response(ack(ControlModule::UploadFileInit));
        session.on_response(ack(ControlModule::UploadFileChunk));
        let step = session.on_response(ack(ControlModule::UploadFileChunk));

        let encoded = step.request.unwrap().payload["chunkData"]
            .as_str()
            .unwrap()
            .to_string();
        assert_eq!(STANDARD.decode(encoded).unwrap().len(), 2500 - 2048);
    }

    #[test]
    fn test_progress_prefers_server_value() {
        let mut session = session(2500);
        session.start();
        session.on_response(ack(ControlModule::UploadFileInit));

        let step = session.on_response(Ok(ControlResponse::ok(
            "upload_file_chunk",
            json!({ "progress": 40 }),
        )));
        assert_eq!(
            step.events[0],
            TransferEvent::Progress {
                chunk_index: 0,
                percent: 40
            }
        );

        let step = session.on_response(ack(ControlModule::UploadFileChunk));
        assert_eq!(
            step.events[0],
            TransferEvent::Progress {
                chunk_index: 1,
                percent: 67
            }
        );
    }

    #[test]
    fn test_retry_resends_identical_chunk() {
        let mut session = session(2500);
        session.start();
        let first = session.on_response(ack(ControlModule::UploadFileInit));
        let retry = session.on_response(nack(ControlModule::UploadFileChunk));

        assert_eq!(first.request, retry.request);
        assert_eq!(
            session.state(),
            TransferState::RetryingChunk {
                chunk_index: 0,
                attempt: 1
            }
        );
        assert!(matches!(
            retry.events[0],
            TransferEvent::ChunkRetry { attempt: 1, .. }
        ));

        let next = session.on_response(ack(ControlModule::UploadFileChunk));
        assert_eq!(chunk_index(&next), 1);
    }

    #[test]
    fn test_retry_bound_fails_transfer() {
        let mut session = session(2500);
        session.start();
        session.on_response(ack(ControlModule::UploadFileInit));
        session.on_response(nack(ControlModule::UploadFileChunk));
        session.on_response(Err(ControlError::NotConnected));
        let step = session.on_response(nack(ControlModule::UploadFileChunk));

        assert!(step.request.is_none());
        assert_eq!(
            step.events.as_slice(),
            &[TransferEvent::Failed(ControlError::ChunkRetryExhausted {
                chunk_index: 0,
                attempts: 3
            })]
        );
        assert!(matches!(
            session.finish(),
            Err(ControlError::ChunkRetryExhausted { .. })
        ));
    }

    #[test]
    fn test_retry_counter_resets_after_ack() {
        let mut session = session(3072);
        session.start();
        session.on_response(ack(ControlModule::UploadFileInit));
        session.on_response(nack(ControlModule::UploadFileChunk));
        session.on_response(nack(ControlModule::UploadFileChunk));
        session.on_response(ack(ControlModule::UploadFileChunk));
        session.on_response(nack(ControlModule::UploadFileChunk));
        let step = session.on_response(nack(ControlModule::UploadFileChunk));

        assert_eq!(chunk_index(&step), 1);
        assert_eq!(
            session.state(),
            TransferState::RetryingChunk {
                chunk_index: 1,
                attempt: 2
            }
        );
    }

    #[test]
    fn test_init_failure_sends_no_chunks() {
        let mut session = session(2500);
        session.start();
        let step = session.on_response(nack(ControlModule::UploadFileInit));
        assert!(step.request.is_none());
        assert!(matches!(
            session.finish(),
            Err(ControlError::InitFailure { .. })
        ));
    }

    #[test]
    fn test_empty_file_goes_straight_to_completion() {
        let mut session = session(0);
        session.start();
        let step = session.on_response(ack(ControlModule::UploadFileInit));
        assert_eq!(
            step.request.unwrap().module,
            ControlModule::UploadFileComplete
        );
        let step = session.on_response(ack(ControlModule::UploadFileComplete));
        assert!(step.events[0].is_terminal());
        assert_eq!(session.finish().unwrap().total_chunks, 0);
    }

    #[test]
    fn test_completion_failure_is_distinct() {
        let mut session = session(10);
        session.start();
        session.on_response(ack(ControlModule::UploadFileInit));
        session.on_response(ack(ControlModule::UploadFileChunk));
        session.on_response(nack(ControlModule::UploadFileComplete));
        assert!(matches!(
            session.finish(),
            Err(ControlError::CompletionFailure { .. })
        ));
    }

    #[test]
    fn test_responses_after_terminal_state_are_ignored() {
        let mut session = session(0);
        session.start();
        session.on_response(nack(ControlModule::UploadFileInit));
        let step = session.on_response(ack(ControlModule::UploadFileInit));
        assert!(step.events.is_empty());
        assert!(step.request.is_none());
        assert_eq!(session.state(), TransferState::Failed);
    }

    #[test]
    fn test_file_id_format() {
        let id = generate_file_id("adu.bin");
        let parts: Vec<&str> = id.splitn(4, '-').collect();
        assert_eq!(parts[0], "file");
        assert!(parts[1].parse::<u128>().is_ok());
        assert!(parts[2].parse::<u16>().unwrap() < 10_000);
        assert_eq!(parts[3], "adu.bin");
    }
}
