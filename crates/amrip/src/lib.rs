//! Acquisition and decryption pipeline for protected streaming audio.
//!
//! The crate coordinates, per track: catalog metadata lookup, stream-variant
//! selection, container download, sample-plan assembly, the decrypt-oracle
//! wire protocol against a fleet of device-side backends, and hand-off to the
//! post-processing collaborators. Collections fan out into concurrent
//! per-track acquisitions under a global concurrency cap.
//!
//! External services (catalog HTTP, media transforms, device recovery) are
//! modeled as traits; `http` and `post` carry the stock implementations.

pub mod assembler;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod decrypt;
pub mod device;
pub mod error;
pub mod http;
pub mod manifest;
pub mod orchestrator;
pub mod plan;
pub mod post;
pub mod retry;
pub mod status;

pub use assembler::{ContainerInspector, Fmp4Inspector, TrackAssembler};
pub use catalog::{
    CatalogService, CollectionKind, CollectionPage, CollectionRef, MediaFetcher,
    StreamUrlOverride, TrackMetadata, TrackRef,
};
pub use codec::Codec;
pub use config::{CodecFallback, DecryptRetryConfig, RipConfig, VariantCaps};
pub use decrypt::DecryptSession;
pub use device::{
    hyper_pool, CommandAgent, DeviceAgent, DeviceLink, EscalationStep, FleetScheduler, RetryLedger,
};
pub use error::RipError;
pub use http::{HttpCatalog, HttpMediaFetcher};
pub use manifest::{StreamSource, Variant};
pub use orchestrator::{AcquisitionOrchestrator, Collaborators};
pub use plan::{KeySet, MovieTimes, SamplePlan, SampleUnit};
pub use post::{
    Encapsulator, FfmpegVerifier, FinishedTrack, FsOutputSink, IntegrityVerifier, OutputSink,
    PassthroughEncapsulator,
};
pub use retry::{retry_with_backoff, RetryAction, RetryPolicy};
pub use status::{CollectionReport, TrackReport, TrackState};
