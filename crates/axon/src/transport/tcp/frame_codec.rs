// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Length-prefix framing for axon traffic over TCP.
//!
//! TCP is a byte stream; frames delimit messages:
//!
//! ```text
//! +----------------+----------+----------------------+
//! | length (4B BE) | kind u8  | body (length-1 bytes) |
//! +----------------+----------+----------------------+
//! ```
//!
//! The length covers kind + body. The codec keeps partial-read state so
//! it can be driven by non-blocking sockets: call [`FrameCodec::decode`]
//! whenever the socket is readable until it returns `Ok(None)`.

use std::io::{self, Read};

/// Frame header size (4-byte length prefix).
pub const FRAME_HEADER_SIZE: usize = 4;

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Session opening: version + identity of the initiator
    Handshake = 1,
    /// Accepting side's answer to a valid handshake
    HandshakeAck = 2,
    /// Topic data (header + payload)
    Data = 3,
    /// Service request
    Request = 4,
    /// Service response
    Response = 5,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Handshake),
            2 => Some(Self::HandshakeAck),
            3 => Some(Self::Data),
            4 => Some(Self::Request),
            5 => Some(Self::Response),
            _ => None,
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub body: Vec<u8>,
}

/// Incremental frame decoder with a size guard.
#[derive(Debug)]
pub struct FrameCodec {
    state: ReadState,
    buffer: Vec<u8>,
    max_size: usize,
    frames_decoded: u64,
    frames_rejected: u64,
}

#[derive(Debug, Clone, Copy)]
enum ReadState {
    Length { bytes_read: usize },
    Body { expected: usize, bytes_read: usize },
}

impl Default for ReadState {
    fn default() -> Self {
        ReadState::Length { bytes_read: 0 }
    }
}

impl FrameCodec {
    /// Create a codec rejecting frames above `max_size` bytes.
    pub fn new(max_size: usize) -> Self {
        Self {
            state: ReadState::default(),
            buffer: vec![0u8; FRAME_HEADER_SIZE],
            max_size,
            frames_decoded: 0,
            frames_rejected: 0,
        }
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected
    }

    /// Frame a message: `[len][kind][body]`.
    #[must_use]
    pub fn encode(kind: FrameKind, body: &[u8]) -> Vec<u8> {
        let len = (body.len() + 1) as u32;
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + 1 + body.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.push(kind as u8);
        frame.extend_from_slice(body);
        frame
    }

    /// Pull the next complete frame out of `reader`.
    ///
    /// * `Ok(Some(frame))` - a full frame was read
    /// * `Ok(None)` - the socket would block; try again on readability
    /// * `Err(_)` - stream closed or protocol violation
    pub fn decode<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Option<Frame>> {
        loop {
            match self.state {
                ReadState::Length { bytes_read } => {
                    match reader.read(&mut self.buffer[bytes_read..FRAME_HEADER_SIZE]) {
                        Ok(0) => {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                if bytes_read == 0 {
                                    "connection closed"
                                } else {
                                    "connection closed inside frame header"
                                },
                            ));
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < FRAME_HEADER_SIZE {
                                self.state = ReadState::Length { bytes_read: total };
                                continue;
                            }
                            let len = u32::from_be_bytes([
                                self.buffer[0],
                                self.buffer[1],
                                self.buffer[2],
                                self.buffer[3],
                            ]) as usize;
                            if len == 0 || len > self.max_size {
                                self.frames_rejected += 1;
                                self.state = ReadState::default();
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    format!("frame length {len} outside 1..={}", self.max_size),
                                ));
                            }
                            self.buffer.resize(len, 0);
                            self.state = ReadState::Body {
                                expected: len,
                                bytes_read: 0,
                            };
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            self.state = ReadState::Length { bytes_read };
                            return Ok(None);
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
                ReadState::Body {
                    expected,
                    bytes_read,
                } => {
                    match reader.read(&mut self.buffer[bytes_read..expected]) {
                        Ok(0) => {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed inside frame body",
                            ));
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < expected {
                                self.state = ReadState::Body {
                                    expected,
                                    bytes_read: total,
                                };
                                continue;
                            }

                            let kind = FrameKind::from_u8(self.buffer[0]).ok_or_else(|| {
                                io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    format!("unknown frame kind {}", self.buffer[0]),
                                )
                            })?;
                            let body = self.buffer[1..expected].to_vec();

                            self.frames_decoded += 1;
                            self.state = ReadState::default();
                            self.buffer.resize(FRAME_HEADER_SIZE, 0);
                            return Ok(Some(Frame { kind, body }));
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            self.state = ReadState::Body {
                                expected,
                                bytes_read,
                            };
                            return Ok(None);
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that yields its data in fixed-size chunks, then WouldBlock.
    struct Chunked {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Read for Chunked {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos >= self.data.len() {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "drained"));
            }
            let n = self.chunk.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_encode_layout() {
        let frame = FrameCodec::encode(FrameKind::Data, b"abc");
        assert_eq!(&frame[..4], &4u32.to_be_bytes());
        assert_eq!(frame[4], FrameKind::Data as u8);
        assert_eq!(&frame[5..], b"abc");
    }

    #[test]
    fn test_decode_single_frame() {
        let encoded = FrameCodec::encode(FrameKind::Request, b"payload");
        let mut codec = FrameCodec::new(1024);
        let mut reader = Cursor::new(encoded);

        let frame = codec.decode(&mut reader).expect("decode").expect("frame");
        assert_eq!(frame.kind, FrameKind::Request);
        assert_eq!(frame.body, b"payload");
        assert_eq!(codec.frames_decoded(), 1);
    }

    #[test]
    fn test_decode_across_chunks() {
        let mut data = FrameCodec::encode(FrameKind::Data, &vec![9u8; 1000]);
        data.extend(FrameCodec::encode(FrameKind::Response, b"second"));

        let mut reader = Chunked {
            data,
            pos: 0,
            chunk: 7,
        };
        let mut codec = FrameCodec::new(4096);

        let mut frames = Vec::new();
        loop {
            match codec.decode(&mut reader) {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(e) => panic!("decode error: {e}"),
            }
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].body.len(), 1000);
        assert_eq!(frames[1].kind, FrameKind::Response);
        assert_eq!(frames[1].body, b"second");
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let encoded = FrameCodec::encode(FrameKind::Data, &vec![0u8; 100]);
        let mut codec = FrameCodec::new(16);
        let mut reader = Cursor::new(encoded);

        assert!(codec.decode(&mut reader).is_err());
        assert_eq!(codec.frames_rejected(), 1);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut encoded = FrameCodec::encode(FrameKind::Data, b"x");
        encoded[4] = 0xEF;
        let mut codec = FrameCodec::new(1024);
        let mut reader = Cursor::new(encoded);

        assert!(codec.decode(&mut reader).is_err());
    }

    #[test]
    fn test_eof_is_error() {
        let mut codec = FrameCodec::new(1024);
        let mut reader = Cursor::new(Vec::<u8>::new());
        let err = codec.decode(&mut reader).expect_err("eof");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
