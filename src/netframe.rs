//! Per-connection frame reassembly and output queueing.
//!
//! Every connection runs the same two-state receive automaton: an 8-byte
//! header into a fixed buffer, then the declared number of body bytes into
//! an owned allocation. One `read(2)` per readiness event; a frame is
//! surfaced as soon as its last byte lands. The writer side is a FIFO of
//! owned frames with a consumed-offset; a partial `write(2)` just advances
//! the offset.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};

use mfs_proto::{parse_header, HDR_SIZE};

pub enum ReadOutcome {
    /// Nothing complete yet (partial read or `EWOULDBLOCK`).
    Pending,
    /// One complete frame: `(type, body)`.
    Frame(u32, Vec<u8>),
    /// Orderly end of stream.
    Closed,
}

enum ReadState {
    Header,
    Body { msg_type: u32, body: Vec<u8> },
}

pub struct FrameReader {
    max_size: u32,
    state: ReadState,
    hdr: [u8; HDR_SIZE],
    filled: usize,
}

impl FrameReader {
    pub fn new(max_size: u32) -> Self {
        FrameReader {
            max_size,
            state: ReadState::Header,
            hdr: [0u8; HDR_SIZE],
            filled: 0,
        }
    }

    /// Issue one read against `sock` and advance the automaton.
    pub fn read(&mut self, sock: &mut impl Read) -> std::io::Result<ReadOutcome> {
        let target: &mut [u8] = match &mut self.state {
            ReadState::Header => &mut self.hdr,
            ReadState::Body { body, .. } => body,
        };
        let n = match sock.read(&mut target[self.filled..]) {
            Ok(0) => return Ok(ReadOutcome::Closed),
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(ReadOutcome::Pending),
            Err(err) if err.kind() == ErrorKind::Interrupted => return Ok(ReadOutcome::Pending),
            Err(err) => return Err(err),
        };
        self.filled += n;
        if self.filled < target.len() {
            return Ok(ReadOutcome::Pending);
        }

        match std::mem::replace(&mut self.state, ReadState::Header) {
            ReadState::Header => {
                let (msg_type, length) = parse_header(&self.hdr);
                self.filled = 0;
                if length > self.max_size {
                    return Err(std::io::Error::new(
                        ErrorKind::InvalidData,
                        format!("packet too long ({}/{})", length, self.max_size),
                    ));
                }
                if length == 0 {
                    return Ok(ReadOutcome::Frame(msg_type, Vec::new()));
                }
                self.state = ReadState::Body {
                    msg_type,
                    body: vec![0u8; length as usize],
                };
                Ok(ReadOutcome::Pending)
            }
            ReadState::Body { msg_type, body } => {
                self.filled = 0;
                Ok(ReadOutcome::Frame(msg_type, body))
            }
        }
    }
}

#[derive(Default)]
pub struct FrameWriter {
    queue: VecDeque<Vec<u8>>,
    offset: usize,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Vec<u8>) {
        self.queue.push_back(frame);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Frames waiting to leave, the partially sent one included.
    pub fn queued_frames(&self) -> usize {
        self.queue.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.offset = 0;
    }

    /// Issue one write for the frame at the head of the queue.
    /// Returns the number of bytes that left the buffer.
    pub fn write(&mut self, sock: &mut impl Write) -> std::io::Result<usize> {
        let front = match self.queue.front() {
            Some(front) => front,
            None => return Ok(0),
        };
        let n = match sock.write(&front[self.offset..]) {
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(0),
            Err(err) if err.kind() == ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(err),
        };
        self.offset += n;
        if self.offset == front.len() {
            self.queue.pop_front();
            self.offset = 0;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mfs_proto::FrameBuilder;

    /// Reader that hands out its data a few bytes at a time.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.step.min(self.data.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn reassembles_across_short_reads() {
        let frame = FrameBuilder::new(42, 12)
            .put_u64(7)
            .put_u32(9)
            .finish();
        let mut src = Trickle {
            data: frame,
            pos: 0,
            step: 3,
        };
        let mut reader = FrameReader::new(1000);
        loop {
            match reader.read(&mut src).unwrap() {
                ReadOutcome::Pending => continue,
                ReadOutcome::Frame(msg_type, body) => {
                    assert_eq!(msg_type, 42);
                    assert_eq!(body.len(), 12);
                    break;
                }
                ReadOutcome::Closed => panic!("closed early"),
            }
        }
        // stream end after the frame
        assert!(matches!(
            reader.read(&mut src).unwrap(),
            ReadOutcome::Closed
        ));
    }

    #[test]
    fn empty_body_frame_completes_on_header() {
        let frame = FrameBuilder::new(0, 0).finish();
        let mut src = Trickle {
            data: frame,
            pos: 0,
            step: 8,
        };
        let mut reader = FrameReader::new(1000);
        match reader.read(&mut src).unwrap() {
            ReadOutcome::Frame(0, body) => assert!(body.is_empty()),
            _ => panic!("expected a frame"),
        }
    }

    #[test]
    fn oversize_frame_is_fatal() {
        let frame = FrameBuilder::new(1, 2000).put_bytes(&[0u8; 2000]).finish();
        let mut src = Trickle {
            data: frame,
            pos: 0,
            step: 8,
        };
        let mut reader = FrameReader::new(1000);
        assert!(reader.read(&mut src).is_err());
    }

    /// Writer that accepts only a couple of bytes per call.
    struct Throttle {
        data: Vec<u8>,
        step: usize,
    }

    impl Write for Throttle {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let n = self.step.min(buf.len());
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn writer_advances_through_partial_writes() {
        let mut writer = FrameWriter::new();
        let a = FrameBuilder::new(1, 4).put_u32(0xAABBCCDD).finish();
        let b = FrameBuilder::new(2, 0).finish();
        writer.push(a.clone());
        writer.push(b.clone());
        assert_eq!(writer.queued_frames(), 2);

        let mut sink = Throttle {
            data: Vec::new(),
            step: 5,
        };
        while !writer.is_empty() {
            writer.write(&mut sink).unwrap();
        }
        let mut expect = a;
        expect.extend_from_slice(&b);
        assert_eq!(sink.data, expect);
    }
}
