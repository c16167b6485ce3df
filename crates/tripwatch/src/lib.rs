//! `tripwatch` - offline-resilient location telemetry for traveler safety
//!
//! Positions are sampled on a battery-aware cadence, encrypted per record,
//! buffered in a bounded two-tier store that survives restarts and storage
//! failures, and uploaded in chunks with exponential-backoff retries. A
//! check-in monitor watches the traveler's planned destinations and raises
//! the alarm when one is missed.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod adapters;
pub mod buffer;
pub mod checkin;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod position;
pub mod sampler;
pub mod storage;
pub mod upload;

pub use buffer::{Admission, BufferStats, EncryptedBuffer, SharedBuffer};
pub use checkin::{CheckInMonitor, Destination, DestinationStatus};
pub use config::Config;
pub use crypto::CryptoCodec;
pub use error::{Error, Result};
pub use logging::init_logging;
pub use pipeline::{Pipeline, PipelineDeps, PipelineStatus};
pub use position::{PositionFix, PositionSample, PositionSource, Tier};
pub use sampler::{PositionSampler, SamplerEvent};
pub use upload::{UploadCoordinator, UploadResult, UploadSink};
