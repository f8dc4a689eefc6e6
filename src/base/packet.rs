// Kobuki packet framing
//
// Frame format: [0xAA, 0x55, Length, Payload..., Checksum]
// Payload is a run of sub-payloads: [Id, Len, Data...]
// Checksum is the XOR of Length and every payload byte, so a valid frame
// folds to zero over Length..=Checksum.

use tracing::debug;

/// Start marker bytes
pub const HEADER: [u8; 2] = [0xAA, 0x55];

/// Largest payload a single length byte can declare
pub const MAX_PAYLOAD: usize = u8::MAX as usize;

/// Header + length + checksum
const OVERHEAD: usize = HEADER.len() + 2;

/// A frame whose checksum has been verified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Vec<u8>,
}

impl Frame {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// XOR-fold used for both building and verifying frames
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &b| acc ^ b)
}

/// Wrap a payload in header, length and checksum
pub fn build_frame(payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= MAX_PAYLOAD, "payload too long for one frame");
    let length = payload.len() as u8;
    let mut frame = Vec::with_capacity(OVERHEAD + payload.len());

    frame.extend_from_slice(&HEADER);
    frame.push(length);
    frame.extend_from_slice(payload);

    // Checksum over length and payload
    let cs = checksum(&frame[HEADER.len()..]);
    frame.push(cs);

    frame
}

/// Counters kept by the frame finder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frames: u64,
    pub dropped_frames: u64,
    pub discarded_bytes: u64,
}

/// Stateful scanner turning a byte stream into validated frames.
///
/// Bytes that do not yet complete a frame are kept between calls to
/// [`feed`](Self::feed), so a frame split across reads is still found.
/// A frame that fails its checksum is dropped and scanning restarts right
/// after its start marker, which lets a real frame hidden inside a bogus
/// declared length be recovered.
#[derive(Debug, Default)]
pub struct FrameFinder {
    buffer: Vec<u8>,
    stats: FrameStats,
}

impl FrameFinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and iterate over every frame they complete
    pub fn feed(&mut self, bytes: &[u8]) -> Frames<'_> {
        self.buffer.extend_from_slice(bytes);
        Frames { finder: self }
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Bytes held while waiting for the rest of a frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Forget any partial frame
    pub fn clear(&mut self) {
        self.stats.discarded_bytes += self.buffer.len() as u64;
        self.buffer.clear();
    }

    fn discard(&mut self, count: usize) {
        self.buffer.drain(..count);
        self.stats.discarded_bytes += count as u64;
    }

    fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match find_header(&self.buffer) {
                Some(0) => {}
                Some(pos) => self.discard(pos),
                None => {
                    // Keep a trailing first marker byte, its partner may be in the next read
                    let keep = usize::from(self.buffer.last() == Some(&HEADER[0]));
                    let garbage = self.buffer.len() - keep;
                    self.discard(garbage);
                    return None;
                }
            }

            let Some(&length) = self.buffer.get(HEADER.len()) else {
                return None;
            };
            let total = OVERHEAD + length as usize;
            if self.buffer.len() < total {
                return None;
            }

            if checksum(&self.buffer[HEADER.len()..total]) == 0 {
                let payload = self.buffer[HEADER.len() + 1..total - 1].to_vec();
                self.buffer.drain(..total);
                self.stats.frames += 1;
                return Some(Frame { payload });
            }

            debug!(length, "Checksum mismatch, resynchronising");
            self.stats.dropped_frames += 1;
            self.discard(HEADER.len());
        }
    }
}

/// Frames completed by one [`FrameFinder::feed`] call
pub struct Frames<'a> {
    finder: &'a mut FrameFinder,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        self.finder.next_frame()
    }
}

fn find_header(data: &[u8]) -> Option<usize> {
    data.windows(HEADER.len()).position(|w| w == HEADER)
}
