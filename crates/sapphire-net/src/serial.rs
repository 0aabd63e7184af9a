//! Serial fallback link
//!
//! A framed byte stream for devices attached over a serial port: SOF byte,
//! length/complement header, payload, big-endian CRC-16 (AUG-CCITT). Every
//! write step handshakes on an ACK byte; a NAK or corrupt frame restarts
//! the attempt, up to four times. The framing layer is generic over any
//! `Read + Write` stream so it can run against an in-memory port in tests.

use crate::data::SerialFrameHeader;
use crate::error::{NetError, Result};
use bytes::BytesMut;
use crc::{Crc, CRC_16_SPI_FUJITSU};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const SERIAL_SOF: u8 = 0xfd;
pub const SERIAL_ACK: u8 = 0xa1;
pub const SERIAL_NAK: u8 = 0x1b;

const FRAME_TRIES: u32 = 4;
const BAUD_RATE: u32 = 115_200;
const PORT_TIMEOUT: Duration = Duration::from_secs(1);

/// CRC-16/AUG-CCITT over the frame payload
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_SPI_FUJITSU);

pub fn frame_crc(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Frame reader/writer over a byte stream
pub struct SerialFramer<T> {
    stream: T,
}

impl<T: Read + Write> SerialFramer<T> {
    pub fn new(stream: T) -> Self {
        Self { stream }
    }

    /// Read one frame, retrying on inconsistent headers or a bad CRC
    pub fn read_frame(&mut self) -> Result<Vec<u8>> {
        for _ in 0..FRAME_TRIES {
            let mut header_buf = [0u8; SerialFrameHeader::SIZE];
            self.read_bytes(&mut header_buf)?;
            let header = SerialFrameHeader::unpack(&mut &header_buf[..])?;

            if !header.is_consistent() {
                debug!("serial header mismatch, resynchronizing");
                continue;
            }

            let mut data = vec![0u8; header.len as usize];
            self.read_bytes(&mut data)?;

            let mut crc_buf = [0u8; 2];
            self.read_bytes(&mut crc_buf)?;

            if frame_crc(&data) == u16::from_be_bytes(crc_buf) {
                return Ok(data);
            }

            debug!("serial crc mismatch, retrying");
        }

        Err(NetError::Frame)
    }

    /// Write one frame with the per-step ACK handshake
    pub fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        for _ in 0..FRAME_TRIES {
            self.stream.write_all(&[SERIAL_SOF])?;
            if !self.await_ack()? {
                continue;
            }

            let mut header = BytesMut::new();
            SerialFrameHeader::for_len(data.len() as u16).pack(&mut header);
            self.stream.write_all(&header)?;
            if !self.await_ack()? {
                continue;
            }

            self.stream.write_all(data)?;
            self.stream.write_all(&frame_crc(data).to_be_bytes())?;
            if self.await_ack()? {
                return Ok(());
            }
        }

        Err(NetError::Frame)
    }

    /// Wait for the handshake byte; a timeout or NAK fails the step
    fn await_ack(&mut self) -> Result<bool> {
        let mut byte = [0u8; 1];
        match self.stream.read_exact(&mut byte) {
            Ok(()) => Ok(byte[0] == SERIAL_ACK),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(false),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                NetError::Timeout
            } else {
                NetError::Io(e)
            }
        })
    }
}

/// A device reachable over a serial port instead of the network
#[derive(Clone)]
pub struct SerialChannel {
    host: String,
    framer: Arc<Mutex<SerialFramer<Box<dyn serialport::SerialPort>>>>,
}

impl SerialChannel {
    pub fn open(path: &str) -> Result<Self> {
        let port = serialport::new(path, BAUD_RATE)
            .timeout(PORT_TIMEOUT)
            .open()?;

        Ok(Self {
            host: path.to_string(),
            framer: Arc::new(Mutex::new(SerialFramer::new(port))),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// One command round-trip. Port I/O is blocking, so it runs off the
    /// async runtime.
    pub async fn exchange(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let framer = self.framer.clone();

        tokio::task::spawn_blocking(move || {
            let mut framer = framer.lock();
            framer.write_frame(&data)?;
            framer.read_frame()
        })
        .await
        .map_err(|e| NetError::Io(std::io::Error::other(e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    /// In-memory port: scripted input, captured output
    struct FakePort {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl FakePort {
        fn new(input: Vec<u8>) -> Self {
            Self {
                input: Cursor::new(input),
                output: Vec::new(),
            }
        }
    }

    impl Read for FakePort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for FakePort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn good_frame(data: &[u8]) -> Vec<u8> {
        let mut out = BytesMut::new();
        SerialFrameHeader::for_len(data.len() as u16).pack(&mut out);
        out.extend_from_slice(data);
        out.extend_from_slice(&frame_crc(data).to_be_bytes());
        out.to_vec()
    }

    #[test]
    fn test_write_frame_layout() {
        let port = FakePort::new(vec![SERIAL_ACK, SERIAL_ACK, SERIAL_ACK]);
        let mut framer = SerialFramer::new(port);

        framer.write_frame(b"data").unwrap();

        let out = &framer.stream.output;
        assert_eq!(out[0], SERIAL_SOF);
        // len 4 little-endian, then its complement
        assert_eq!(&out[1..3], &[0x04, 0x00]);
        assert_eq!(&out[3..5], &(!4u16).to_le_bytes());
        assert_eq!(&out[5..9], b"data");
        assert_eq!(&out[9..], &frame_crc(b"data").to_be_bytes());
    }

    #[test]
    fn test_write_retries_after_nak() {
        let port = FakePort::new(vec![SERIAL_NAK, SERIAL_ACK, SERIAL_ACK, SERIAL_ACK]);
        let mut framer = SerialFramer::new(port);

        framer.write_frame(b"x").unwrap();

        // first attempt aborted at the SOF handshake, second went through
        let sofs = framer
            .stream
            .output
            .iter()
            .filter(|b| **b == SERIAL_SOF)
            .count();
        assert_eq!(sofs, 2);
    }

    #[test]
    fn test_write_gives_up() {
        let port = FakePort::new(vec![SERIAL_NAK; FRAME_TRIES as usize]);
        let mut framer = SerialFramer::new(port);

        assert!(matches!(framer.write_frame(b"x"), Err(NetError::Frame)));
    }

    #[test]
    fn test_read_frame() {
        let port = FakePort::new(good_frame(b"payload"));
        let mut framer = SerialFramer::new(port);

        assert_eq!(framer.read_frame().unwrap(), b"payload");
    }

    #[test]
    fn test_read_retries_on_corrupt_crc() {
        let mut corrupted = good_frame(b"payload");
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xff;
        corrupted.extend_from_slice(&good_frame(b"payload"));

        let mut framer = SerialFramer::new(FakePort::new(corrupted));
        assert_eq!(framer.read_frame().unwrap(), b"payload");
    }

    #[test]
    fn test_read_resynchronizes_on_bad_header() {
        let mut stream = vec![0x04, 0x00, 0x00, 0x00]; // len and complement disagree
        stream.extend_from_slice(&good_frame(b"ok"));

        let mut framer = SerialFramer::new(FakePort::new(stream));
        assert_eq!(framer.read_frame().unwrap(), b"ok");
    }

    #[test]
    fn test_crc_is_aug_ccitt() {
        // check value from the CRC catalogue
        assert_eq!(frame_crc(b"123456789"), 0xe5cc);
    }
}
