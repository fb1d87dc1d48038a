use bytes::{Buf, BufMut};

// Every record on disk is written as: len (u32 LE) | crc32c(payload) (u32 LE) | payload.
const HEADER_LEN: usize = 8;

pub(super) fn write_frame(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.reserve(HEADER_LEN + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_u32_le(crc32c::crc32c(payload));
    buf.put_slice(payload);
}

/// Frames parsed from the front of a buffer.
pub(super) struct ReadFrames<'a> {
    pub(super) payloads: Vec<&'a [u8]>,
    // Length of the prefix holding complete, checksum-valid frames. Anything past this is a torn
    // or corrupt tail.
    pub(super) valid_len: usize,
}

/// Parses complete frames until the first one that is truncated or fails its checksum.
pub(super) fn read_frames(data: &[u8]) -> ReadFrames<'_> {
    let mut payloads = Vec::new();
    let mut offset = 0;

    while data.len() - offset >= HEADER_LEN {
        let mut header = &data[offset..offset + HEADER_LEN];
        let len = header.get_u32_le() as usize;
        let crc = header.get_u32_le();

        let start = offset + HEADER_LEN;
        let end = match start.checked_add(len) {
            Some(end) if end <= data.len() => end,
            _ => break,
        };
        let payload = &data[start..end];
        if crc32c::crc32c(payload) != crc {
            break;
        }

        payloads.push(payload);
        offset = end;
    }

    ReadFrames {
        payloads,
        valid_len: offset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_read_back_in_order() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"one");
        write_frame(&mut buf, b"");
        write_frame(&mut buf, b"three");

        let frames = read_frames(&buf);
        assert_eq!(frames.payloads, vec![&b"one"[..], &b""[..], &b"three"[..]]);
        assert_eq!(frames.valid_len, buf.len());
    }

    #[test]
    fn checksum_is_standard_crc32c_at_any_alignment() {
        // Payloads inside a journal buffer start at arbitrary offsets.
        let mut backing = vec![0u8; 3];
        backing.extend_from_slice(b"123456789");
        for start in 0..3 {
            let mut buf = Vec::new();
            buf.extend_from_slice(&backing[..start]);
            write_frame(&mut buf, &backing[3..]);

            let mut header = &buf[start + 4..start + HEADER_LEN];
            assert_eq!(header.get_u32_le(), 0xe306_9283);
            let frames = read_frames(&buf[start..]);
            assert_eq!(frames.payloads, vec![&b"123456789"[..]]);
        }
    }

    #[test]
    fn torn_tail_is_excluded() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"complete");
        let complete_len = buf.len();
        write_frame(&mut buf, b"partially written");
        buf.truncate(buf.len() - 4);

        let frames = read_frames(&buf);
        assert_eq!(frames.payloads, vec![&b"complete"[..]]);
        assert_eq!(frames.valid_len, complete_len);
    }

    #[test]
    fn checksum_mismatch_stops_reading() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"good");
        let good_len = buf.len();
        write_frame(&mut buf, b"flipped");
        write_frame(&mut buf, b"after");
        buf[good_len + HEADER_LEN] ^= 0xff;

        let frames = read_frames(&buf);
        assert_eq!(frames.payloads.len(), 1);
        assert_eq!(frames.valid_len, good_len);
    }
}
