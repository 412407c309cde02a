//! Flat sample-table walk: numbered sample payloads with durations.

use bytes::Bytes;

use crate::Mp4Error;
use crate::boxes::{BoxWalk, find_child, read_u32};

/// One sample as seen by the flat walk. Numbers start at 1 and run across
/// fragment boundaries, matching how inspection tools number samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSample {
    pub number: u64,
    pub duration: u32,
    pub data: Bytes,
}

/// Per-run bookkeeping collected from a `moof`, waiting for its `mdat`.
struct PendingEntry {
    size: u32,
    duration: u32,
}

/// Walk the container pairing `trun` entries with the byte ranges of the
/// following `mdat` payload.
///
/// This walk is deliberately independent of [`crate::fragment_headers`]: it
/// never looks at sample-description indices, and the header walk never looks
/// at sizes. The two views must agree sample-for-sample in a well-formed
/// container.
pub fn sample_table(data: &Bytes) -> Result<Vec<TableSample>, Mp4Error> {
    let mut samples = Vec::new();
    let mut pending: Vec<PendingEntry> = Vec::new();
    let mut number = 0u64;

    for span in BoxWalk::over(data) {
        let span = span?;
        match &span.fourcc {
            b"moof" => {
                if !pending.is_empty() {
                    return Err(Mp4Error::malformed(
                        "moof encountered while previous fragment's samples lack an mdat",
                    ));
                }
                pending = collect_fragment_entries(data, span.payload_start, span.payload_end)?;
            }
            b"mdat" => {
                let mut offset = span.payload_start;
                for entry in pending.drain(..) {
                    let end = offset + entry.size as usize;
                    if end > span.payload_end {
                        return Err(Mp4Error::malformed(
                            "mdat payload shorter than the sizes declared by its trun",
                        ));
                    }
                    number += 1;
                    samples.push(TableSample {
                        number,
                        duration: entry.duration,
                        data: data.slice(offset..end),
                    });
                    offset = end;
                }
            }
            _ => {}
        }
    }

    if !pending.is_empty() {
        return Err(Mp4Error::malformed("trailing moof without an mdat"));
    }

    Ok(samples)
}

fn collect_fragment_entries(
    data: &Bytes,
    start: usize,
    limit: usize,
) -> Result<Vec<PendingEntry>, Mp4Error> {
    let traf =
        find_child(data, start, limit, b"traf")?.ok_or(Mp4Error::MissingBox { fourcc: "traf" })?;

    let tfhd = find_child(data, traf.payload_start, traf.payload_end, b"tfhd")?
        .ok_or(Mp4Error::MissingBox { fourcc: "tfhd" })?;
    let defaults = tfhd_defaults(data, tfhd.payload_start)?;

    let mut entries = Vec::new();
    for child in BoxWalk::new(data, traf.payload_start, traf.payload_end) {
        let child = child?;
        if child.fourcc == *b"trun" {
            parse_trun_entries(data, child.payload_start, &defaults, &mut entries)?;
        }
    }
    if entries.is_empty() {
        return Err(Mp4Error::MissingBox { fourcc: "trun" });
    }
    Ok(entries)
}

struct TfhdDefaults {
    duration: Option<u32>,
    size: Option<u32>,
}

fn tfhd_defaults(data: &Bytes, payload_start: usize) -> Result<TfhdDefaults, Mp4Error> {
    let flags = read_u32(data, payload_start)? & 0x00FF_FFFF;
    let mut offset = payload_start + 8; // version/flags + track_ID
    if flags & 0x1 != 0 {
        offset += 8; // base_data_offset
    }
    if flags & 0x2 != 0 {
        offset += 4; // sample_description_index (the header walk's concern)
    }
    let duration = if flags & 0x8 != 0 {
        let v = read_u32(data, offset)?;
        offset += 4;
        Some(v)
    } else {
        None
    };
    let size = if flags & 0x10 != 0 {
        Some(read_u32(data, offset)?)
    } else {
        None
    };
    Ok(TfhdDefaults { duration, size })
}

fn parse_trun_entries(
    data: &Bytes,
    payload_start: usize,
    defaults: &TfhdDefaults,
    entries: &mut Vec<PendingEntry>,
) -> Result<(), Mp4Error> {
    let flags = read_u32(data, payload_start)? & 0x00FF_FFFF;
    let sample_count = read_u32(data, payload_start + 4)?;

    let mut offset = payload_start + 8;
    if flags & 0x1 != 0 {
        offset += 4; // data_offset
    }
    if flags & 0x4 != 0 {
        offset += 4; // first_sample_flags
    }

    let duration_present = flags & 0x100 != 0;
    let size_present = flags & 0x200 != 0;
    let flags_present = flags & 0x400 != 0;
    let cto_present = flags & 0x800 != 0;

    for _ in 0..sample_count {
        let duration = if duration_present {
            let v = read_u32(data, offset)?;
            offset += 4;
            v
        } else {
            defaults.duration.ok_or_else(|| {
                Mp4Error::malformed("trun omits durations and tfhd has no default")
            })?
        };
        let size = if size_present {
            let v = read_u32(data, offset)?;
            offset += 4;
            v
        } else {
            defaults
                .size
                .ok_or_else(|| Mp4Error::malformed("trun omits sizes and tfhd has no default"))?
        };
        if flags_present {
            offset += 4;
        }
        if cto_present {
            offset += 4;
        }
        entries.push(PendingEntry { size, duration });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{mdat, moof, tfhd, trun, trun_sizes};

    fn container(parts: Vec<Vec<u8>>) -> Bytes {
        let mut out = Vec::new();
        for part in parts {
            out.extend_from_slice(&part);
        }
        Bytes::from(out)
    }

    #[test]
    fn slices_mdat_by_trun_sizes() {
        let data = container(vec![
            moof(tfhd(Some(1), None), vec![trun(&[(1024, 3), (1024, 2)])]),
            mdat(b"aaabb"),
            moof(tfhd(Some(2), None), vec![trun(&[(512, 4)])]),
            mdat(b"cccc"),
        ]);

        let samples = sample_table(&data).expect("walk");
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].number, 1);
        assert_eq!(samples[0].data.as_ref(), b"aaa");
        assert_eq!(samples[0].duration, 1024);
        assert_eq!(samples[1].data.as_ref(), b"bb");
        assert_eq!(samples[2].number, 3);
        assert_eq!(samples[2].data.as_ref(), b"cccc");
        assert_eq!(samples[2].duration, 512);
    }

    #[test]
    fn durations_fall_back_to_tfhd_default() {
        let data = container(vec![
            moof(tfhd(Some(1), Some(1024)), vec![trun_sizes(&[2, 2])]),
            mdat(b"xxyy"),
        ]);
        let samples = sample_table(&data).expect("walk");
        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.duration == 1024));
    }

    #[test]
    fn short_mdat_is_rejected() {
        let data = container(vec![
            moof(tfhd(Some(1), None), vec![trun(&[(1024, 10)])]),
            mdat(b"short"),
        ]);
        assert!(matches!(sample_table(&data), Err(Mp4Error::Malformed { .. })));
    }

    #[test]
    fn moof_without_mdat_is_rejected() {
        let data = container(vec![moof(tfhd(Some(1), None), vec![trun(&[(1024, 1)])])]);
        assert!(matches!(sample_table(&data), Err(Mp4Error::Malformed { .. })));
    }
}
