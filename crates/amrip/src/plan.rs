//! Sample plans and content-key sets — the data handed to a decrypt session.

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};

use crate::codec::Codec;

/// Track id sent to the oracle in place of the real one for prefetch/trailer
/// samples.
pub const SENTINEL_TRACK_ID: &str = "0";

/// Reserved key URI under which stores serve prefetch/trailer samples.
pub const PREFETCH_KEY_URI: &str = "skd://itunes.apple.com/P000000000/s1/e1";

/// One encrypted sample, ready to be streamed to the oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleUnit {
    pub data: Bytes,
    pub duration: u32,
    /// Index into the [`KeySet`]; transitions between consecutive samples
    /// drive key announcements on the wire.
    pub key_group: usize,
}

/// Container-level creation/modification times, carried through for tagging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovieTimes {
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl MovieTimes {
    /// Convert `mvhd` Mac-epoch seconds (since 1904-01-01) to UTC datetimes.
    pub fn from_mac_epoch(ts: fmp4::MacTimestamps) -> Option<Self> {
        let epoch = Utc.with_ymd_and_hms(1904, 1, 1, 0, 0, 0).single()?;
        let convert = |secs: u64| {
            i64::try_from(secs)
                .ok()
                .and_then(|s| epoch.checked_add_signed(chrono::Duration::seconds(s)))
        };
        Some(Self {
            created: convert(ts.creation)?,
            modified: convert(ts.modification)?,
        })
    }
}

/// Ordered decryption plan for one track.
///
/// Concatenating the decrypted outputs in sample order rebuilds the
/// elementary stream; the order must never be disturbed.
#[derive(Debug, Clone)]
pub struct SamplePlan {
    pub codec: Codec,
    pub samples: Vec<SampleUnit>,
    /// Codec-specific decoder configuration (`alac` cookie, `esds`) needed
    /// for re-encapsulation. Mandatory for lossless and AAC-family codecs.
    pub decoder_config: Option<Bytes>,
    pub times: Option<MovieTimes>,
}

impl SamplePlan {
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Total plaintext size, used to presize the output buffer.
    pub fn total_len(&self) -> usize {
        self.samples.iter().map(|s| s.data.len()).sum()
    }
}

/// Ordered content-key URIs for one track.
///
/// Index 0 is always the reserved prefetch placeholder; real keys follow in
/// the order the stream manifest declared them. Samples address keys by
/// key-group index.
#[derive(Debug, Clone)]
pub struct KeySet {
    uris: Vec<String>,
}

impl KeySet {
    pub fn new() -> Self {
        Self {
            uris: vec![PREFETCH_KEY_URI.to_string()],
        }
    }

    pub fn push(&mut self, uri: impl Into<String>) {
        self.uris.push(uri.into());
    }

    pub fn uri(&self, index: usize) -> Option<&str> {
        self.uris.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.uris.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uris.is_empty()
    }

    /// True when only the prefetch placeholder is present.
    pub fn has_only_prefetch(&self) -> bool {
        self.uris.len() == 1
    }
}

impl Default for KeySet {
    fn default() -> Self {
        Self::new()
    }
}
