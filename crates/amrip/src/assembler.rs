//! Turns a raw downloaded container into an ordered [`SamplePlan`].
//!
//! Two independent views of the same container — the fragment-header walk
//! (which key group covers how many samples) and the flat sample table (the
//! actual bytes) — are zipped 1:1. Any sample number present in one view but
//! not the other means the container is structurally damaged and the track
//! fails without retry.

use bytes::Bytes;
use tracing::debug;

use crate::codec::Codec;
use crate::error::RipError;
use crate::plan::{MovieTimes, SamplePlan, SampleUnit};

/// Produces the two structural parses the assembler aligns, plus the side
/// data carried through for re-encapsulation and tagging.
pub trait ContainerInspector: Send + Sync {
    fn fragment_headers(&self, container: &Bytes) -> Result<Vec<fmp4::FragmentHeader>, RipError>;
    fn sample_table(&self, container: &Bytes) -> Result<Vec<fmp4::TableSample>, RipError>;
    fn decoder_config(
        &self,
        container: &Bytes,
        kind: fmp4::DecoderConfigKind,
    ) -> Result<Option<Bytes>, RipError>;
    fn movie_timestamps(&self, container: &Bytes)
        -> Result<Option<fmp4::MacTimestamps>, RipError>;
}

/// In-process inspector backed by the `fmp4` walks.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fmp4Inspector;

impl ContainerInspector for Fmp4Inspector {
    fn fragment_headers(&self, container: &Bytes) -> Result<Vec<fmp4::FragmentHeader>, RipError> {
        Ok(fmp4::fragment_headers(container)?)
    }

    fn sample_table(&self, container: &Bytes) -> Result<Vec<fmp4::TableSample>, RipError> {
        Ok(fmp4::sample_table(container)?)
    }

    fn decoder_config(
        &self,
        container: &Bytes,
        kind: fmp4::DecoderConfigKind,
    ) -> Result<Option<Bytes>, RipError> {
        Ok(fmp4::decoder_config(container, kind)?)
    }

    fn movie_timestamps(
        &self,
        container: &Bytes,
    ) -> Result<Option<fmp4::MacTimestamps>, RipError> {
        Ok(fmp4::movie_timestamps(container)?)
    }
}

pub struct TrackAssembler<'a> {
    inspector: &'a dyn ContainerInspector,
}

impl<'a> TrackAssembler<'a> {
    pub fn new(inspector: &'a dyn ContainerInspector) -> Self {
        Self { inspector }
    }

    /// Build the ordered decryption plan for one raw container.
    ///
    /// No network I/O; deterministic for a given container.
    pub fn plan(&self, raw: &Bytes, codec: Codec) -> Result<SamplePlan, RipError> {
        let headers = self.inspector.fragment_headers(raw)?;
        let table = self.inspector.sample_table(raw)?;

        let mut samples = Vec::with_capacity(table.len());
        let mut table_iter = table.into_iter();
        let mut next_number: u64 = 1;

        for header in &headers {
            for _ in 0..header.sample_count() {
                let entry = table_iter
                    .next()
                    .filter(|s| s.number == next_number)
                    .ok_or(RipError::SampleTableMismatch {
                        sample_number: next_number,
                    })?;
                samples.push(SampleUnit {
                    data: entry.data,
                    duration: entry.duration,
                    key_group: header.description_index,
                });
                next_number += 1;
            }
        }
        // Samples the flat table has but no fragment header accounts for.
        if let Some(orphan) = table_iter.next() {
            return Err(RipError::SampleTableMismatch {
                sample_number: orphan.number,
            });
        }

        let decoder_config = match codec.decoder_config_kind() {
            Some(kind) => {
                let blob =
                    self.inspector
                        .decoder_config(raw, kind)?
                        .ok_or(RipError::CodecMismatch {
                            codec,
                            reason: "decoder configuration atom missing".to_string(),
                        })?;
                Some(blob)
            }
            None => None,
        };

        let times = self
            .inspector
            .movie_timestamps(raw)?
            .and_then(MovieTimes::from_mac_epoch);

        debug!(
            %codec,
            fragments = headers.len(),
            samples = samples.len(),
            "sample plan assembled"
        );
        Ok(SamplePlan {
            codec,
            samples,
            decoder_config,
            times,
        })
    }
}
