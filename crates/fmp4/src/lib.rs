//! Minimal fMP4/ISOBMFF helpers for encrypted-sample bookkeeping.
//!
//! This crate provides two independent walks over the same fragmented
//! container:
//!
//! - [`fragment_headers`]: a `moof`-level walk that reads each fragment's
//!   sample-description index (`tfhd`) and the sample counts of its runs
//!   (`trun`), i.e. *which key group applies to how many samples*.
//! - [`sample_table`]: a flat walk that pairs every `trun` entry's size and
//!   duration with consecutive byte ranges of the following `mdat` payload,
//!   i.e. *the actual sample bytes, numbered from 1*.
//!
//! Callers zip the two walks together; a sample number present in one walk
//! but not the other indicates a structurally damaged container.
//!
//! Also exposed: decoder-configuration atom extraction (`alac`/`esds`) and
//! `mvhd` creation/modification timestamps, both needed downstream for
//! re-encapsulation and tagging.

mod boxes;
mod fragment;
mod sidecar;
mod table;

pub use fragment::{FragmentHeader, fragment_headers};
pub use sidecar::{DecoderConfigKind, MacTimestamps, decoder_config, movie_timestamps};
pub use table::{TableSample, sample_table};

#[derive(Debug, thiserror::Error)]
pub enum Mp4Error {
    #[error("container truncated inside box at offset {offset}")]
    Truncated { offset: usize },

    #[error("required box `{fourcc}` not found")]
    MissingBox { fourcc: &'static str },

    #[error("malformed container: {reason}")]
    Malformed { reason: String },
}

impl Mp4Error {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}
