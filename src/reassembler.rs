//! ## Stream reassembler
//!
//! Turns an arbitrarily chunked TCP byte stream into whole frames. A brick
//! always emits one complete frame per USB IN transfer, so this is only
//! needed on the TCP side of the daemon (`brick_protocol.py::dataReceived`
//! in the original implementation).

use crate::constants::frame::{HEADER_SIZE, MAX_LENGTH, MIN_LENGTH};
use crate::error::{Error, Result};
use crate::frame::Frame;

#[derive(Debug, Default)]
pub struct Reassembler {
    buf: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Reassembler { buf: Vec::new() }
    }

    /// Feed a chunk of bytes read off the socket. Returns every whole frame
    /// that could be cut off the buffer, in order. `Err` means the stream is
    /// malformed (declared length outside `4..=64`) and the connection must
    /// be closed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            if self.buf.len() < HEADER_SIZE {
                break;
            }

            let declared = u16::from_le_bytes([self.buf[2], self.buf[3]]) as usize;
            if declared < MIN_LENGTH || declared > MAX_LENGTH {
                return Err(Error::FrameLength(declared));
            }

            if self.buf.len() < declared {
                break;
            }

            let rest = self.buf.split_off(declared);
            let frame_bytes = std::mem::replace(&mut self.buf, rest);
            frames.push(Frame::parse(&frame_bytes)?);
        }

        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stack_id: u8, ty: u8, payload: &[u8]) -> Vec<u8> {
        let len = (HEADER_SIZE + payload.len()) as u16;
        let mut bytes = vec![stack_id, ty, 0, 0];
        bytes[2..4].copy_from_slice(&len.to_le_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn single_chunk_single_frame() {
        let mut r = Reassembler::new();
        let bytes = frame(1, 2, b"hi");
        let out = r.feed(&bytes).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_bytes(), &bytes[..]);
    }

    #[test]
    fn split_across_many_chunks() {
        let mut r = Reassembler::new();
        let bytes = frame(1, 2, b"hello world");
        let mut out = Vec::new();
        for byte in &bytes {
            out.extend(r.feed(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_bytes(), &bytes[..]);
    }

    #[test]
    fn coalesced_frames_in_one_chunk() {
        let mut r = Reassembler::new();
        let a = frame(1, 10, b"aa");
        let b = frame(2, 20, b"bbbb");
        let mut combined = a.clone();
        combined.extend_from_slice(&b);

        let out = r.feed(&combined).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_bytes(), &a[..]);
        assert_eq!(out[1].as_bytes(), &b[..]);
    }

    #[test]
    fn roundtrip_arbitrary_chunking() {
        let frames: Vec<Vec<u8>> = vec![
            frame(0, 254, &[]),
            frame(3, 7, b"payload"),
            frame(1, 1, &[9, 9, 9]),
        ];
        let mut stream = Vec::new();
        for f in &frames {
            stream.extend_from_slice(f);
        }

        // split at a handful of arbitrary points, not aligned to frame boundaries
        let splits = [1usize, 5, 6, 13, 20];
        let mut r = Reassembler::new();
        let mut out = Vec::new();
        let mut start = 0;
        for &s in &splits {
            if s > stream.len() {
                break;
            }
            out.extend(r.feed(&stream[start..s]).unwrap());
            start = s;
        }
        out.extend(r.feed(&stream[start..]).unwrap());

        assert_eq!(out.len(), frames.len());
        for (got, want) in out.iter().zip(frames.iter()) {
            assert_eq!(got.as_bytes(), &want[..]);
        }
    }

    #[test]
    fn rejects_oversized_declared_length() {
        let mut r = Reassembler::new();
        let bytes = vec![0u8, 0, 200, 0]; // declares 200, way past MAX_LENGTH
        assert!(r.feed(&bytes).is_err());
    }

    #[test]
    fn rejects_undersized_declared_length() {
        let mut r = Reassembler::new();
        let bytes = vec![0u8, 0, 2, 0]; // declares 2, below header size
        assert!(r.feed(&bytes).is_err());
    }
}
