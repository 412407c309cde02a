//! Box-level traversal primitives shared by the container walks.

use crate::Mp4Error;

/// Byte span of a single box: its FourCC and the payload range within the
/// buffer the span was parsed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BoxSpan {
    pub fourcc: [u8; 4],
    pub payload_start: usize,
    pub payload_end: usize,
    /// Offset of the first byte after this box.
    pub end: usize,
}

impl BoxSpan {
    pub fn payload<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.payload_start..self.payload_end]
    }
}

/// Parse the box starting at `offset` within `[offset..limit)`.
///
/// Handles 32-bit sizes, 64-bit extended sizes (`size == 1`) and
/// box-extends-to-end (`size == 0`).
pub(crate) fn box_at(data: &[u8], offset: usize, limit: usize) -> Result<BoxSpan, Mp4Error> {
    if offset + 8 > limit {
        return Err(Mp4Error::Truncated { offset });
    }

    let size32 = u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ]) as u64;
    let fourcc = [
        data[offset + 4],
        data[offset + 5],
        data[offset + 6],
        data[offset + 7],
    ];

    let (size, header_len) = match size32 {
        0 => ((limit - offset) as u64, 8usize),
        1 => {
            if offset + 16 > limit {
                return Err(Mp4Error::Truncated { offset });
            }
            let mut be = [0u8; 8];
            be.copy_from_slice(&data[offset + 8..offset + 16]);
            (u64::from_be_bytes(be), 16usize)
        }
        n => (n, 8usize),
    };

    let size = usize::try_from(size).map_err(|_| Mp4Error::Truncated { offset })?;
    if size < header_len || offset + size > limit {
        return Err(Mp4Error::Truncated { offset });
    }

    Ok(BoxSpan {
        fourcc,
        payload_start: offset + header_len,
        payload_end: offset + size,
        end: offset + size,
    })
}

/// Iterator over the sibling boxes in `[start..limit)`.
pub(crate) struct BoxWalk<'a> {
    data: &'a [u8],
    offset: usize,
    limit: usize,
}

impl<'a> BoxWalk<'a> {
    pub fn new(data: &'a [u8], start: usize, limit: usize) -> Self {
        Self {
            data,
            offset: start,
            limit,
        }
    }

    pub fn over(data: &'a [u8]) -> Self {
        Self::new(data, 0, data.len())
    }
}

impl Iterator for BoxWalk<'_> {
    type Item = Result<BoxSpan, Mp4Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.limit {
            return None;
        }
        match box_at(self.data, self.offset, self.limit) {
            Ok(span) => {
                self.offset = span.end;
                Some(Ok(span))
            }
            Err(e) => {
                // Stop the walk; a truncated box poisons everything after it.
                self.offset = self.limit;
                Some(Err(e))
            }
        }
    }
}

/// Find the first direct child with the given FourCC inside `[start..limit)`.
pub(crate) fn find_child(
    data: &[u8],
    start: usize,
    limit: usize,
    target: &[u8; 4],
) -> Result<Option<BoxSpan>, Mp4Error> {
    for span in BoxWalk::new(data, start, limit) {
        let span = span?;
        if span.fourcc == *target {
            return Ok(Some(span));
        }
    }
    Ok(None)
}

/// Descend a chain of nested boxes, returning the innermost span.
pub(crate) fn descend(
    data: &[u8],
    start: usize,
    limit: usize,
    path: &[&'static [u8; 4]],
) -> Result<Option<BoxSpan>, Mp4Error> {
    let mut range = (start, limit);
    let mut found = None;
    for target in path {
        match find_child(data, range.0, range.1, target)? {
            Some(span) => {
                range = (span.payload_start, span.payload_end);
                found = Some(span);
            }
            None => return Ok(None),
        }
    }
    Ok(found)
}

/// Read a big-endian u32 at `offset`, failing on short input.
pub(crate) fn read_u32(data: &[u8], offset: usize) -> Result<u32, Mp4Error> {
    if offset + 4 > data.len() {
        return Err(Mp4Error::Truncated { offset });
    }
    Ok(u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::boxed;

    #[test]
    fn walks_siblings_in_order() {
        let mut data = boxed(b"ftyp", b"M4A ");
        data.extend_from_slice(&boxed(b"moov", &[]));
        data.extend_from_slice(&boxed(b"mdat", &[1, 2, 3]));

        let fourccs: Vec<[u8; 4]> = BoxWalk::over(&data)
            .map(|span| span.map(|s| s.fourcc))
            .collect::<Result<_, _>>()
            .expect("walk");
        assert_eq!(fourccs, vec![*b"ftyp", *b"moov", *b"mdat"]);
    }

    #[test]
    fn extended_size_box_parses() {
        let payload = [7u8; 4];
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&(16u64 + payload.len() as u64).to_be_bytes());
        data.extend_from_slice(&payload);

        let span = box_at(&data, 0, data.len()).expect("parse");
        assert_eq!(span.fourcc, *b"mdat");
        assert_eq!(span.payload(&data), &payload);
    }

    #[test]
    fn size_zero_extends_to_limit() {
        let mut data = Vec::new();
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&[9, 9, 9]);

        let span = box_at(&data, 0, data.len()).expect("parse");
        assert_eq!(span.payload(&data), &[9, 9, 9]);
    }

    #[test]
    fn truncated_box_is_an_error() {
        let mut data = boxed(b"mdat", &[1, 2, 3, 4]);
        data.truncate(10);
        assert!(matches!(
            box_at(&data, 0, data.len()),
            Err(Mp4Error::Truncated { offset: 0 })
        ));
    }

    #[test]
    fn descend_reaches_nested_payload() {
        let inner = boxed(b"tfhd", &[0xAA]);
        let traf = boxed(b"traf", &inner);
        let moof = boxed(b"moof", &traf);

        let span = descend(&moof, 0, moof.len(), &[b"moof", b"traf", b"tfhd"])
            .expect("walk")
            .expect("found");
        assert_eq!(span.payload(&moof), &[0xAA]);
    }
}
