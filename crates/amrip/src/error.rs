use crate::codec::Codec;

/// Error taxonomy for the acquisition pipeline.
///
/// `is_retryable()` separates transient faults (retried with backoff at the
/// layer that observed them) from per-track and per-device fatal conditions.
#[derive(Debug, thiserror::Error)]
pub enum RipError {
    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("configuration error: {reason}")]
    Config { reason: String },

    #[error("catalog error: {reason}")]
    Catalog { reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("manifest error: {reason}")]
    Manifest { reason: String },

    #[error("no stream variant for codec `{codec}`")]
    CodecNotFound { codec: Codec },

    #[error("no audio stream available for track {track_id}")]
    AudioUnavailable { track_id: String },

    #[error("track {track_id} does not exist in storefront {storefront}")]
    NotInStorefront {
        track_id: String,
        storefront: String,
    },

    #[error("download length mismatch: server declared {expected}, received {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    #[error("container parse error: {source}")]
    Container {
        #[from]
        source: fmp4::Mp4Error,
    },

    #[error("sample table misalignment: fragment walk references sample {sample_number} missing from the flat table")]
    SampleTableMismatch { sample_number: u64 },

    #[error("container does not match codec `{codec}`: {reason}")]
    CodecMismatch { codec: Codec, reason: String },

    #[error("sample references key group {index} beyond the key list")]
    KeyIndexOutOfRange { index: usize },

    #[error("{what} of {len} bytes does not fit its wire-frame length prefix")]
    FrameTooLong { what: &'static str, len: usize },

    #[error("connection to decrypt oracle on device {serial} refused")]
    OracleConnect { serial: String },

    #[error("short read from decrypt oracle on device {serial}")]
    OracleShortRead { serial: String },

    #[error("decryption of track {track_id} failed beyond the retry budget")]
    DecryptFailed { track_id: String },

    #[error("recovery of device {serial} failed: {reason}")]
    RecoveryFailed { serial: String, reason: String },

    #[error("no device available for storefront {storefront}")]
    NoDeviceAvailable { storefront: String },

    #[error("integrity check failed: {reason}")]
    IntegrityCheckFailed { reason: String },

    #[error("encapsulation failed: {reason}")]
    Encapsulate { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl RipError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    pub fn catalog(reason: impl Into<String>) -> Self {
        Self::Catalog {
            reason: reason.into(),
        }
    }

    pub fn manifest(reason: impl Into<String>) -> Self {
        Self::Manifest {
            reason: reason.into(),
        }
    }

    pub fn integrity(reason: impl Into<String>) -> Self {
        Self::IntegrityCheckFailed {
            reason: reason.into(),
        }
    }

    pub fn encapsulate(reason: impl Into<String>) -> Self {
        Self::Encapsulate {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Whether the layer that observed this error may retry the operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Io { .. }
            | Self::LengthMismatch { .. }
            | Self::OracleConnect { .. }
            | Self::OracleShortRead { .. }
            | Self::IntegrityCheckFailed { .. } => true,
            Self::InvalidUrl { .. }
            | Self::Config { .. }
            | Self::Catalog { .. }
            | Self::Manifest { .. }
            | Self::CodecNotFound { .. }
            | Self::AudioUnavailable { .. }
            | Self::NotInStorefront { .. }
            | Self::Container { .. }
            | Self::SampleTableMismatch { .. }
            | Self::CodecMismatch { .. }
            | Self::KeyIndexOutOfRange { .. }
            | Self::FrameTooLong { .. }
            | Self::DecryptFailed { .. }
            | Self::RecoveryFailed { .. }
            | Self::NoDeviceAvailable { .. }
            | Self::Encapsulate { .. }
            | Self::Internal { .. } => false,
        }
    }
}
