//! Side data needed downstream: decoder-configuration atoms and movie
//! timestamps.

use bytes::Bytes;

use crate::Mp4Error;
use crate::boxes::{BoxWalk, descend, find_child};

/// Which decoder-configuration atom a codec requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderConfigKind {
    /// `alac` magic-cookie atom (lossless).
    Alac,
    /// `esds` elementary-stream descriptor (AAC family).
    Esds,
}

impl DecoderConfigKind {
    fn fourcc(self) -> &'static [u8; 4] {
        match self {
            Self::Alac => b"alac",
            Self::Esds => b"esds",
        }
    }
}

/// `mvhd` creation/modification times, in seconds since 1904-01-01 UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacTimestamps {
    pub creation: u64,
    pub modification: u64,
}

/// Extract a decoder-configuration atom from the sample description.
///
/// Looks inside `moov/trak/mdia/minf/stbl/stsd` for an `enca` (or, for clear
/// containers, `mp4a`/`alac`) audio sample entry and returns the requested
/// child atom with its header, the shape re-encapsulation tools expect.
pub fn decoder_config(data: &Bytes, kind: DecoderConfigKind) -> Result<Option<Bytes>, Mp4Error> {
    let Some(stsd) = descend(
        data,
        0,
        data.len(),
        &[b"moov", b"trak", b"mdia", b"minf", b"stbl", b"stsd"],
    )?
    else {
        return Ok(None);
    };

    // stsd payload: version/flags + entry_count, then sample entries.
    let entries_start = stsd.payload_start + 8;
    for entry in BoxWalk::new(data, entries_start, stsd.payload_end) {
        let entry = entry?;
        if !matches!(&entry.fourcc, b"enca" | b"mp4a" | b"alac") {
            continue;
        }
        // AudioSampleEntry carries 28 bytes of fixed fields before children.
        let children_start = entry.payload_start + 28;
        if children_start >= entry.payload_end {
            continue;
        }
        if let Some(atom) = find_child(data, children_start, entry.payload_end, kind.fourcc())? {
            // These atoms always use the compact 8-byte header.
            let atom_start = atom.payload_start - 8;
            return Ok(Some(data.slice(atom_start..atom.payload_end)));
        }
    }

    Ok(None)
}

/// Read `mvhd` creation/modification timestamps (Mac epoch).
pub fn movie_timestamps(data: &Bytes) -> Result<Option<MacTimestamps>, Mp4Error> {
    let Some(mvhd) = descend(data, 0, data.len(), &[b"moov", b"mvhd"])? else {
        return Ok(None);
    };

    let payload = mvhd.payload(data);
    if payload.is_empty() {
        return Err(Mp4Error::malformed("empty mvhd"));
    }
    match payload[0] {
        0 if payload.len() >= 12 => Ok(Some(MacTimestamps {
            creation: u64::from(u32::from_be_bytes([
                payload[4], payload[5], payload[6], payload[7],
            ])),
            modification: u64::from(u32::from_be_bytes([
                payload[8], payload[9], payload[10], payload[11],
            ])),
        })),
        1 if payload.len() >= 20 => {
            let mut creation = [0u8; 8];
            creation.copy_from_slice(&payload[4..12]);
            let mut modification = [0u8; 8];
            modification.copy_from_slice(&payload[12..20]);
            Ok(Some(MacTimestamps {
                creation: u64::from_be_bytes(creation),
                modification: u64::from_be_bytes(modification),
            }))
        }
        v => Err(Mp4Error::malformed(format!("unsupported mvhd version {v}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{boxed, full_box};

    fn audio_sample_entry(fourcc: &[u8; 4], child: Vec<u8>) -> Vec<u8> {
        let mut payload = vec![0u8; 28];
        payload.extend_from_slice(&child);
        boxed(fourcc, &payload)
    }

    fn stsd(entries: Vec<Vec<u8>>) -> Vec<u8> {
        let mut payload = vec![0u8; 4]; // version/flags
        payload.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        for entry in entries {
            payload.extend_from_slice(&entry);
        }
        boxed(b"stsd", &payload)
    }

    fn moov_with_stsd(stsd: Vec<u8>) -> Bytes {
        let stbl = boxed(b"stbl", &stsd);
        let minf = boxed(b"minf", &stbl);
        let mdia = boxed(b"mdia", &minf);
        let trak = boxed(b"trak", &mdia);
        Bytes::from(boxed(b"moov", &trak))
    }

    #[test]
    fn extracts_alac_cookie_from_enca_entry() {
        let cookie = boxed(b"alac", &[1, 2, 3, 4]);
        let data = moov_with_stsd(stsd(vec![audio_sample_entry(b"enca", cookie.clone())]));

        let atom = decoder_config(&data, DecoderConfigKind::Alac)
            .expect("walk")
            .expect("atom present");
        assert_eq!(atom.as_ref(), cookie.as_slice());
    }

    #[test]
    fn missing_config_atom_yields_none() {
        let data = moov_with_stsd(stsd(vec![audio_sample_entry(b"enca", vec![])]));
        assert!(
            decoder_config(&data, DecoderConfigKind::Esds)
                .expect("walk")
                .is_none()
        );
    }

    #[test]
    fn reads_v0_mvhd_timestamps() {
        let mut payload = vec![0u8; 4]; // version 0 + flags
        payload.extend_from_slice(&100u32.to_be_bytes()); // creation
        payload.extend_from_slice(&200u32.to_be_bytes()); // modification
        payload.extend_from_slice(&[0u8; 88]);
        let mvhd = boxed(b"mvhd", &payload);
        let data = Bytes::from(boxed(b"moov", &mvhd));

        let times = movie_timestamps(&data).expect("walk").expect("mvhd");
        assert_eq!(times.creation, 100);
        assert_eq!(times.modification, 200);
    }

    #[test]
    fn reads_v1_mvhd_timestamps() {
        let mut payload = vec![1, 0, 0, 0];
        payload.extend_from_slice(&3_000_000_000u64.to_be_bytes());
        payload.extend_from_slice(&3_000_000_001u64.to_be_bytes());
        payload.extend_from_slice(&[0u8; 88]);
        let mvhd = boxed(b"mvhd", &payload);
        let data = Bytes::from(boxed(b"moov", &mvhd));

        let times = movie_timestamps(&data).expect("walk").expect("mvhd");
        assert_eq!(times.creation, 3_000_000_000);
        assert_eq!(times.modification, 3_000_000_001);
    }

    #[test]
    fn container_without_moov_yields_none() {
        let data = Bytes::from(boxed(b"ftyp", b"M4A "));
        assert!(movie_timestamps(&data).expect("walk").is_none());
    }
}
