//! Pull complete JPEG images out of an undelimited byte stream.
//!
//! `libcamera-vid --codec mjpeg --output -` writes images back to back with
//! no framing, so frames are cut on the SOI (`FF D8`) and EOI (`FF D9`)
//! markers. Reads can split anywhere, including between the two bytes of a
//! marker.

use log::warn;

pub const SOI: [u8; 2] = [0xFF, 0xD8];
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// Partial frames larger than this are treated as garbage.
pub const DEFAULT_MAX_BUFFER: usize = 8 * 1024 * 1024;

#[derive(Debug)]
pub struct FrameExtractor {
    buf: Vec<u8>,
    /// Where the EOI search resumes; the buffer starts at SOI when non-zero.
    scan_from: usize,
    max_buffer: usize,
    discarded: u64,
}

impl Default for FrameExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER)
    }
}

impl FrameExtractor {
    pub fn new(max_buffer: usize) -> Self {
        Self {
            buf: Vec::new(),
            scan_from: 0,
            max_buffer: max_buffer.max(EOI.len() + SOI.len()),
            discarded: 0,
        }
    }

    /// Append `bytes` and return every frame they complete, oldest first.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.scan_from == 0 {
                match find(&self.buf, &SOI, 0) {
                    Some(start) => {
                        self.drop_front(start);
                        self.scan_from = SOI.len();
                    }
                    None => {
                        // Noise. Keep a trailing 0xFF: it may be half an SOI.
                        let keep = usize::from(self.buf.last() == Some(&SOI[0]));
                        let noise = self.buf.len() - keep;
                        self.drop_front(noise);
                        break;
                    }
                }
            }

            // Resume one byte early in case the last scan ended mid-marker.
            let from = self.scan_from.saturating_sub(1).max(SOI.len());
            match find(&self.buf, &EOI, from) {
                Some(end) => {
                    let cut = end + EOI.len();
                    frames.push(self.buf[..cut].to_vec());
                    self.buf.drain(..cut);
                    self.scan_from = 0;
                }
                None => {
                    self.scan_from = self.buf.len();
                    break;
                }
            }
        }

        self.enforce_cap();
        frames
    }

    /// Bytes currently held (a partial frame or a lone marker byte).
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Total bytes thrown away as noise or oversized partial frames.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.scan_from = 0;
    }

    /// A partial frame past the cap is never going to complete sanely:
    /// drop it up to the next SOI, or entirely if there is none.
    fn enforce_cap(&mut self) {
        if self.buf.len() <= self.max_buffer {
            return;
        }
        let next = find(&self.buf, &SOI, SOI.len());
        let cut = next.unwrap_or_else(|| {
            let keep = usize::from(self.buf.last() == Some(&SOI[0]));
            self.buf.len() - keep
        });
        warn!(
            "frame buffer exceeded {} bytes without an end marker, dropping {cut} bytes",
            self.max_buffer
        );
        self.drop_front(cut);
        self.scan_from = if next.is_some() { SOI.len() } else { 0 };
    }

    fn drop_front(&mut self, n: usize) {
        if n > 0 {
            self.buf.drain(..n);
            self.discarded += n as u64;
        }
    }
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut v = SOI.to_vec();
        v.extend_from_slice(body);
        v.extend_from_slice(&EOI);
        v
    }

    #[test]
    fn three_frames_across_awkward_splits() {
        let a = jpeg(b"first frame payload");
        let b = jpeg(&[0x10, 0xFF, 0x00, 0x20, 0x30]);
        let c = jpeg(b"third");
        let mut stream = Vec::new();
        stream.extend_from_slice(&a);
        stream.extend_from_slice(&b);
        stream.extend_from_slice(&c);

        // split inside a's SOI, inside b's EOI, inside c's payload
        let s1 = 1;
        let s2 = a.len() + b.len() - 1;
        let s3 = a.len() + b.len() + 3;
        let mut ex = FrameExtractor::default();
        let mut out = Vec::new();
        out.extend(ex.feed(&stream[..s1]));
        out.extend(ex.feed(&stream[s1..s2]));
        out.extend(ex.feed(&stream[s2..s3]));
        assert_eq!(out, vec![a.clone(), b.clone()], "c is still partial");
        out.extend(ex.feed(&stream[s3..]));

        assert_eq!(out, vec![a, b, c]);
        assert_eq!(ex.pending(), 0);
    }

    #[test]
    fn every_single_split_point_yields_same_frames() {
        let a = jpeg(b"aa");
        let b = jpeg(b"bbb");
        let c = jpeg(b"");
        let stream = [a.clone(), b.clone(), c.clone()].concat();

        for split in 0..=stream.len() {
            let mut ex = FrameExtractor::default();
            let mut out = ex.feed(&stream[..split]);
            out.extend(ex.feed(&stream[split..]));
            assert_eq!(out, vec![a.clone(), b.clone(), c.clone()], "split at {split}");
        }
    }

    #[test]
    fn byte_at_a_time() {
        let frames = vec![jpeg(b"one"), jpeg(b"two")];
        let stream = frames.concat();
        let mut ex = FrameExtractor::default();
        let out: Vec<_> = stream.iter().flat_map(|b| ex.feed(std::slice::from_ref(b))).collect();
        assert_eq!(out, frames);
    }

    #[test]
    fn noise_between_frames_is_dropped() {
        let a = jpeg(b"x");
        let mut stream = b"garbage".to_vec();
        stream.extend_from_slice(&a);
        stream.extend_from_slice(b"more noise");

        let mut ex = FrameExtractor::default();
        assert_eq!(ex.feed(&stream), vec![a]);
        assert_eq!(ex.pending(), 0);
        assert_eq!(ex.discarded(), (b"garbage".len() + b"more noise".len()) as u64);
    }

    #[test]
    fn unterminated_frame_is_capped() {
        let mut ex = FrameExtractor::new(64);
        let mut partial = SOI.to_vec();
        partial.extend(std::iter::repeat(0x11).take(100));
        assert!(ex.feed(&partial).is_empty());
        assert!(ex.pending() <= 64);

        // a fresh frame still comes through afterwards
        let good = jpeg(b"ok");
        assert_eq!(ex.feed(&good), vec![good]);
    }

    #[test]
    fn cap_keeps_a_later_start_marker() {
        let mut ex = FrameExtractor::new(16);
        let mut data = SOI.to_vec();
        data.extend(std::iter::repeat(0x22).take(20));
        data.extend_from_slice(&SOI);
        data.extend_from_slice(b"tail");
        assert!(ex.feed(&data).is_empty());
        assert_eq!(ex.pending(), SOI.len() + 4);
        let mut expect = SOI.to_vec();
        expect.extend_from_slice(b"tail");
        expect.extend_from_slice(&EOI);
        assert_eq!(ex.feed(&EOI), vec![expect]);
    }
}
