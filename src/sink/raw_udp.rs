//! Raw UDP sink.
//!
//! Sends uncompressed frames as a sequence of datagrams. Each datagram starts with a
//! 20-byte big-endian header:
//!
//! | offset | size | field                              |
//! |--------|------|------------------------------------|
//! | 0      | 4    | frame index (wrapping)             |
//! | 4      | 2    | chunk number                       |
//! | 6      | 2    | chunk count (0 marks end of stream)|
//! | 8      | 8    | pts in nanoseconds                 |
//! | 16     | 4    | payload length                     |
//!
//! followed by at most `MAX_CHUNK_PAYLOAD` bytes of pixels.

use std::io;
use std::net::{SocketAddr, UdpSocket};

use super::{FormatGate, PipelineSink};
use crate::error::SinkError;
use crate::frame::TimestampedBuffer;
use crate::pipeline::StreamFormat;

pub const HEADER_LEN: usize = 20;
pub const MAX_CHUNK_PAYLOAD: usize = 1400;

/// Decoded datagram header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    pub frame_index: u32,
    pub chunk: u16,
    pub chunk_count: u16,
    pub pts_ns: u64,
    pub payload_len: u32,
}

impl ChunkHeader {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.frame_index.to_be_bytes());
        out.extend_from_slice(&self.chunk.to_be_bytes());
        out.extend_from_slice(&self.chunk_count.to_be_bytes());
        out.extend_from_slice(&self.pts_ns.to_be_bytes());
        out.extend_from_slice(&self.payload_len.to_be_bytes());
    }

    pub fn decode(datagram: &[u8]) -> Option<Self> {
        let header = datagram.get(..HEADER_LEN)?;
        Some(Self {
            frame_index: u32::from_be_bytes(header[0..4].try_into().ok()?),
            chunk: u16::from_be_bytes(header[4..6].try_into().ok()?),
            chunk_count: u16::from_be_bytes(header[6..8].try_into().ok()?),
            pts_ns: u64::from_be_bytes(header[8..16].try_into().ok()?),
            payload_len: u32::from_be_bytes(header[16..20].try_into().ok()?),
        })
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.chunk_count == 0
    }
}

pub struct RawUdpSink {
    dest: SocketAddr,
    socket: Option<UdpSocket>,
    gate: FormatGate,
    datagram: Vec<u8>,
    eos_sent: bool,
    frames_sent: u64,
    bytes_sent: u64,
}

impl RawUdpSink {
    /// Bind an ephemeral local port for sending to `dest`.
    ///
    /// The socket stays unconnected: a receiver that is not listening yet, or that
    /// restarts mid-stream, must not end the run.
    pub fn open(dest: SocketAddr, queue_frames: u32) -> Result<Self, SinkError> {
        let bind_addr: SocketAddr = if dest.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind_addr)
            .map_err(|err| SinkError::PipelineBuildError(format!("bind udp socket: {}", err)))?;

        log::info!(
            "RawUdpSink: streaming to {} (queue hint {} frames)",
            dest,
            queue_frames
        );
        Ok(Self {
            dest,
            socket: Some(socket),
            gate: FormatGate::default(),
            datagram: Vec::with_capacity(HEADER_LEN + MAX_CHUNK_PAYLOAD),
            eos_sent: false,
            frames_sent: 0,
            bytes_sent: 0,
        })
    }

    fn send(&mut self, header: ChunkHeader, payload: &[u8]) -> Result<(), SinkError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| SinkError::SinkClosed("socket torn down".to_string()))?;
        self.datagram.clear();
        header.encode(&mut self.datagram);
        self.datagram.extend_from_slice(payload);
        match socket.send_to(&self.datagram, self.dest) {
            Ok(sent) => {
                self.bytes_sent += sent as u64;
                Ok(())
            }
            // Nobody listening: the datagram is lost, as it would be on the wire.
            Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                log::debug!("RawUdpSink: {} refused datagram: {}", self.dest, err);
                Ok(())
            }
            Err(err) => Err(map_send_error(err)),
        }
    }
}

fn map_send_error(err: io::Error) -> SinkError {
    if err.kind() == io::ErrorKind::WouldBlock || is_no_buffer_space(&err) {
        SinkError::Backpressured(err.to_string())
    } else {
        SinkError::SinkClosed(err.to_string())
    }
}

#[cfg(target_os = "linux")]
fn is_no_buffer_space(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOBUFS)
}

#[cfg(not(target_os = "linux"))]
fn is_no_buffer_space(_err: &io::Error) -> bool {
    false
}

impl PipelineSink for RawUdpSink {
    fn name(&self) -> &'static str {
        "raw-udp"
    }

    fn declare_format(&mut self, format: StreamFormat) -> Result<(), SinkError> {
        let chunks = format.frame_len().div_ceil(MAX_CHUNK_PAYLOAD);
        if chunks > u16::MAX as usize {
            return Err(SinkError::PipelineBuildError(format!(
                "{}x{} frames need {} datagrams, more than {}",
                format.width,
                format.height,
                chunks,
                u16::MAX
            )));
        }
        self.gate.declare(format)
    }

    fn push(&mut self, buffer: TimestampedBuffer) -> Result<(), SinkError> {
        if self.eos_sent {
            return Err(SinkError::SinkClosed("end of stream already sent".to_string()));
        }
        self.gate.check(&buffer)?;

        let pts_ns = buffer.pts.as_nanos() as u64;
        let frame_index = buffer.index as u32;
        let payload = buffer.into_bytes();
        let chunk_count = payload.len().div_ceil(MAX_CHUNK_PAYLOAD) as u16;

        for (chunk, part) in payload.chunks(MAX_CHUNK_PAYLOAD).enumerate() {
            let header = ChunkHeader {
                frame_index,
                chunk: chunk as u16,
                chunk_count,
                pts_ns,
                payload_len: part.len() as u32,
            };
            self.send(header, part)?;
        }

        self.frames_sent += 1;
        Ok(())
    }

    fn end_of_stream(&mut self) {
        if self.eos_sent || self.socket.is_none() {
            return;
        }
        self.eos_sent = true;
        if self.gate.format().is_none() {
            return;
        }
        let header = ChunkHeader {
            frame_index: self.frames_sent as u32,
            chunk: 0,
            chunk_count: 0,
            pts_ns: 0,
            payload_len: 0,
        };
        if let Err(err) = self.send(header, &[]) {
            log::warn!("RawUdpSink: end-of-stream marker not sent: {}", err);
        }
    }

    fn teardown(&mut self) {
        if self.socket.take().is_some() {
            log::info!(
                "RawUdpSink: closed {} after {} frames ({} KB)",
                self.dest,
                self.frames_sent,
                self.bytes_sent / 1024
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ConvertedFrame, PixelFormat};
    use anyhow::Result;
    use std::time::Duration;

    fn receiver() -> Result<UdpSocket> {
        let socket = UdpSocket::bind("127.0.0.1:0")?;
        socket.set_read_timeout(Some(Duration::from_secs(2)))?;
        Ok(socket)
    }

    fn format(width: u32, height: u32) -> StreamFormat {
        StreamFormat {
            width,
            height,
            pixel_format: PixelFormat::Gray8,
            fps: 30,
        }
    }

    fn frame(width: u32, height: u32, index: u64) -> TimestampedBuffer {
        let len = (width * height) as usize;
        let pixels = (0..len).map(|i| (i % 251) as u8).collect();
        TimestampedBuffer::new(
            ConvertedFrame::new(pixels, width, height, PixelFormat::Gray8),
            index,
            Duration::from_nanos(33_333_333) * index as u32,
            Duration::from_nanos(33_333_333),
        )
    }

    #[test]
    fn frame_is_split_into_ordered_chunks() -> Result<()> {
        let rx = receiver()?;
        let mut sink = RawUdpSink::open(rx.local_addr()?, 4)?;
        sink.declare_format(format(64, 50))?;
        sink.push(frame(64, 50, 3))?;

        let mut reassembled = Vec::new();
        let mut datagram = [0u8; HEADER_LEN + MAX_CHUNK_PAYLOAD];
        for expected_chunk in 0..3u16 {
            let n = rx.recv(&mut datagram)?;
            let header = ChunkHeader::decode(&datagram[..n]).expect("header");
            assert_eq!(header.frame_index, 3);
            assert_eq!(header.chunk, expected_chunk);
            assert_eq!(header.chunk_count, 3);
            assert_eq!(header.pts_ns, 99_999_999);
            assert_eq!(header.payload_len as usize, n - HEADER_LEN);
            reassembled.extend_from_slice(&datagram[HEADER_LEN..n]);
        }
        assert_eq!(reassembled, frame(64, 50, 3).into_bytes());

        sink.end_of_stream();
        let n = rx.recv(&mut datagram)?;
        let eos = ChunkHeader::decode(&datagram[..n]).expect("eos header");
        assert!(eos.is_end_of_stream());
        Ok(())
    }

    #[test]
    fn rejects_undeclared_and_mismatched_buffers() -> Result<()> {
        let rx = receiver()?;
        let mut sink = RawUdpSink::open(rx.local_addr()?, 4)?;
        assert_eq!(sink.push(frame(4, 4, 0)), Err(SinkError::FormatNotDeclared));

        sink.declare_format(format(4, 4))?;
        assert_eq!(
            sink.push(frame(4, 5, 0)),
            Err(SinkError::FormatMismatch {
                expected: 16,
                actual: 20
            })
        );
        Ok(())
    }

    #[test]
    fn absent_receiver_does_not_close_the_stream() -> Result<()> {
        let dest = {
            let gone = UdpSocket::bind("127.0.0.1:0")?;
            gone.local_addr()?
        };
        let mut sink = RawUdpSink::open(dest, 4)?;
        sink.declare_format(format(4, 4))?;
        for index in 0..5 {
            assert_eq!(sink.push(frame(4, 4, index)), Ok(()));
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(sink.frames_sent, 5);
        sink.end_of_stream();
        sink.teardown();
        Ok(())
    }

    #[test]
    fn send_errors_map_to_backpressure_or_closed() {
        assert!(matches!(
            map_send_error(io::Error::from(io::ErrorKind::WouldBlock)),
            SinkError::Backpressured(_)
        ));
        assert!(matches!(
            map_send_error(io::Error::from(io::ErrorKind::PermissionDenied)),
            SinkError::SinkClosed(_)
        ));
    }

    #[test]
    fn push_after_end_of_stream_is_closed() -> Result<()> {
        let rx = receiver()?;
        let mut sink = RawUdpSink::open(rx.local_addr()?, 4)?;
        sink.declare_format(format(4, 4))?;
        sink.end_of_stream();
        sink.end_of_stream();
        assert!(matches!(sink.push(frame(4, 4, 0)), Err(SinkError::SinkClosed(_))));
        Ok(())
    }

    #[test]
    fn teardown_is_idempotent() -> Result<()> {
        let rx = receiver()?;
        let mut sink = RawUdpSink::open(rx.local_addr()?, 4)?;
        sink.declare_format(format(4, 4))?;
        sink.teardown();
        sink.teardown();
        sink.end_of_stream();
        assert!(matches!(sink.push(frame(4, 4, 0)), Err(SinkError::SinkClosed(_))));
        Ok(())
    }
}
