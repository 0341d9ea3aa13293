//! Adaptive filtering: ingestion, retraining and query evolution
//!
//! The [`ingest::IngestionLoop`] filters the live stream with the active
//! classifier while the [`scheduler::RetrainScheduler`] periodically runs a
//! [`retrain::RetrainPipeline`] cycle and publishes the result through the
//! [`handoff::ClassifierHandoff`].

pub mod classifier;
pub mod encoder;
pub mod handoff;
pub mod ingest;
pub mod retrain;
pub mod sampler;
pub mod scheduler;
pub mod terms;

use crate::error::DynHashtagError;
use crate::stream::StreamError;
use std::time::Duration;
use thiserror::Error;

pub use classifier::{Classifier, ClassifierTrainer, Label, LogisticClassifier, LogisticTrainer};
pub use encoder::{FeatureEncoder, FeatureVector};
pub use handoff::{ClassifierHandoff, HandoffReceiver};
pub use ingest::{IngestReport, IngestSettings, IngestState, IngestionLoop};
pub use retrain::{RetrainOutcome, RetrainPipeline};
pub use sampler::CorpusSampler;
pub use scheduler::{JobStatus, RetrainJob, RetrainScheduler, TickOutcome};
pub use terms::{ExpansionPolicy, Selection, TermIndex, TermSelector, TermStats};

/// Reasons a retraining cycle fails; the active snapshot is left untouched
#[derive(Error, Debug)]
pub enum RetrainError {
    #[error("No positive documents in the last {window_hours}h")]
    EmptyCorpus { window_hours: u64 },

    #[error("Negative sample incomplete after {timeout:?}: {collected}/{wanted} documents")]
    SampleTimeout {
        collected: usize,
        wanted: usize,
        timeout: Duration,
    },

    #[error("Training failed: {0}")]
    Training(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Sample stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("A retrain job is already running")]
    AlreadyRunning,
}

impl From<DynHashtagError> for RetrainError {
    fn from(err: DynHashtagError) -> Self {
        RetrainError::Store(err.to_string())
    }
}

/// Conditions that stop the ingestion loop for good
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("Subscription rejected: {0}")]
    Unauthorized(StreamError),

    #[error("Gave up after {attempts} reconnect attempts: {last}")]
    ReconnectExhausted { attempts: u32, last: StreamError },
}
