//! Fragment-header walk: which key group applies to how many samples.

use crate::Mp4Error;
use crate::boxes::{BoxWalk, find_child, read_u32};

/// One `moof` as seen by the header walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Zero-based sample-description index from `tfhd` (absent field means 0).
    ///
    /// In encrypted containers this selects the content key group for every
    /// sample in the fragment.
    pub description_index: usize,
    /// Sample count of each `trun` in the fragment's first `traf`, in order.
    pub run_sample_counts: Vec<u32>,
}

impl FragmentHeader {
    pub fn sample_count(&self) -> u64 {
        self.run_sample_counts.iter().map(|&c| u64::from(c)).sum()
    }
}

/// Walk every `moof` in the container and read its fragment header.
pub fn fragment_headers(data: &[u8]) -> Result<Vec<FragmentHeader>, Mp4Error> {
    let mut fragments = Vec::new();

    for span in BoxWalk::over(data) {
        let span = span?;
        if span.fourcc != *b"moof" {
            continue;
        }

        let traf = find_child(data, span.payload_start, span.payload_end, b"traf")?
            .ok_or(Mp4Error::MissingBox { fourcc: "traf" })?;

        let tfhd = find_child(data, traf.payload_start, traf.payload_end, b"tfhd")?
            .ok_or(Mp4Error::MissingBox { fourcc: "tfhd" })?;
        let description_index = tfhd_description_index(data, &tfhd)?;

        let mut run_sample_counts = Vec::new();
        for child in BoxWalk::new(data, traf.payload_start, traf.payload_end) {
            let child = child?;
            if child.fourcc == *b"trun" {
                run_sample_counts.push(read_u32(data, child.payload_start + 4)?);
            }
        }
        if run_sample_counts.is_empty() {
            return Err(Mp4Error::MissingBox { fourcc: "trun" });
        }

        fragments.push(FragmentHeader {
            description_index,
            run_sample_counts,
        });
    }

    Ok(fragments)
}

/// Read the zero-based sample-description index out of a `tfhd` payload.
///
/// The field is 1-based in the file and optional; absence means the first
/// (and usually only) sample description.
fn tfhd_description_index(
    data: &[u8],
    tfhd: &crate::boxes::BoxSpan,
) -> Result<usize, Mp4Error> {
    let flags = read_u32(data, tfhd.payload_start)? & 0x00FF_FFFF;
    // version(1) + flags(3) + track_ID(4)
    let mut offset = tfhd.payload_start + 8;
    if flags & 0x1 != 0 {
        offset += 8; // base_data_offset
    }
    if flags & 0x2 == 0 {
        return Ok(0);
    }
    let raw = read_u32(data, offset)?;
    if raw == 0 {
        return Err(Mp4Error::malformed("tfhd sample-description index is 0"));
    }
    Ok(raw as usize - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{moof, tfhd, trun};

    #[test]
    fn reads_description_index_and_run_counts() {
        let mut data = moof(tfhd(Some(2), None), vec![trun(&[(1024, 100), (1024, 90)])]);
        data.extend_from_slice(&moof(
            tfhd(None, None),
            vec![trun(&[(1024, 80)]), trun(&[(1024, 70), (1024, 60)])],
        ));

        let frags = fragment_headers(&data).expect("walk");
        assert_eq!(frags.len(), 2);
        assert_eq!(frags[0].description_index, 1);
        assert_eq!(frags[0].run_sample_counts, vec![2]);
        assert_eq!(frags[1].description_index, 0);
        assert_eq!(frags[1].run_sample_counts, vec![1, 2]);
        assert_eq!(frags[1].sample_count(), 3);
    }

    #[test]
    fn moof_without_trun_is_rejected() {
        let data = moof(tfhd(Some(1), None), vec![]);
        assert!(matches!(
            fragment_headers(&data),
            Err(Mp4Error::MissingBox { fourcc: "trun" })
        ));
    }

    #[test]
    fn non_fragment_boxes_are_skipped() {
        let mut data = crate::testutil::boxed(b"ftyp", b"M4A ");
        data.extend_from_slice(&moof(tfhd(Some(1), None), vec![trun(&[(1, 1)])]));
        let frags = fragment_headers(&data).expect("walk");
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].description_index, 0);
    }
}
