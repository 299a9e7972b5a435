//! Crawler module for harvesting the index service
//!
//! This module contains the core harvesting logic, including:
//! - Global request pacing
//! - Decoding of cipher-encoded series
//! - Work-matrix expansion and per-task checkpoints
//! - The per-category capabilities and the engine that runs them

mod capability;
mod checkpoint;
mod decrypt;
mod engine;
mod fetcher;
pub mod kinds;
mod progress;
mod rate_limiter;
mod work;

pub use capability::{
    DecodedPayload, DecodedSeries, EncryptedSeries, ItemOutput, RawPayload, TaskCapability,
};
pub use checkpoint::Checkpoint;
pub use decrypt::{decode, decode_series, decrypt_payload, DecryptError};
pub use engine::{
    truncate_message, Engine, EngineContext, RunOutcome, StopReason, TaskControl,
    MAX_ERROR_MESSAGE_CHARS, REASON_EXHAUSTED, REASON_PAUSED, REASON_PERSISTENCE,
    REASON_SHUTDOWN,
};
pub use fetcher::{
    build_http_client, classify_status, FetchError, UpstreamClient, CIPHER_KEY_PATH,
    STATUS_NOT_LOGGED_IN, STATUS_REQUEST_BLOCKED,
};
pub use kinds::capability_for;
pub use progress::{percent, ProgressReport, ProgressTracker};
pub use rate_limiter::RateLimiter;
pub use work::{count_keys, expand_matrix, matrix_keys, pending_items, WorkItem};
