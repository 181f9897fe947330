//! Serial Line CAN (slcan) Transport
//!
//! Talks the Lawicel ASCII protocol spoken by most USB-CAN adapters over
//! any async byte stream (a `tokio-serial` port in production, an in-memory
//! duplex pipe in tests).

use crate::error::TransportError;
use crate::frame::{CanFrame, MAX_DLC};
use crate::transport::CanTransport;
use async_trait::async_trait;
use nom::{
    bytes::complete::take_while_m_n, character::complete::one_of, combinator::map_res,
    multi::count, IResult,
};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, trace, warn};

/// Adapter error reply
const BELL: u8 = 0x07;
/// Receive buffer size beyond which unterminated input is discarded
const MAX_PENDING_BYTES: usize = 256;

/// Bus bitrate codes for the `S` command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Bitrate {
    Rate10kbit = 0,
    Rate20kbit = 1,
    Rate50kbit = 2,
    Rate100kbit = 3,
    Rate125kbit = 4,
    Rate250kbit = 5,
    Rate500kbit = 6,
    Rate800kbit = 7,
    Rate1000kbit = 8,
}

impl Bitrate {
    /// Map a bitrate in kbit/s to its setup code
    pub fn from_kbps(kbps: u32) -> Option<Self> {
        match kbps {
            10 => Some(Bitrate::Rate10kbit),
            20 => Some(Bitrate::Rate20kbit),
            50 => Some(Bitrate::Rate50kbit),
            100 => Some(Bitrate::Rate100kbit),
            125 => Some(Bitrate::Rate125kbit),
            250 => Some(Bitrate::Rate250kbit),
            500 => Some(Bitrate::Rate500kbit),
            800 => Some(Bitrate::Rate800kbit),
            1000 => Some(Bitrate::Rate1000kbit),
            _ => None,
        }
    }
}

impl Default for Bitrate {
    /// OBD-II over CAN runs at 500 kbit/s
    fn default() -> Self {
        Bitrate::Rate500kbit
    }
}

/// Transmit command for one frame
struct Transmit<'a>(&'a CanFrame);

impl fmt::Display for Transmit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frame = self.0;
        let cmd = match (frame.is_extended(), frame.is_remote()) {
            (false, false) => 't',
            (true, false) => 'T',
            (true, true) => 'R',
            (false, true) => 'r',
        };

        if frame.is_extended() {
            write!(f, "{}{:08X}", cmd, frame.raw_id())?;
        } else {
            write!(f, "{}{:03X}", cmd, frame.raw_id())?;
        }
        write!(f, "{}", frame.len())?;
        for byte in frame.payload() {
            write!(f, "{:02X}", byte)?;
        }
        write!(f, "\r")
    }
}

fn hex_value(digits: usize) -> impl FnMut(&str) -> IResult<&str, u32> {
    move |input: &str| {
        map_res(
            take_while_m_n(digits, digits, |c: char| c.is_ascii_hexdigit()),
            |s: &str| u32::from_str_radix(s, 16),
        )(input)
    }
}

fn hex_byte(input: &str) -> IResult<&str, u8> {
    map_res(
        take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()),
        |s: &str| u8::from_str_radix(s, 16),
    )(input)
}

fn dlc_digit(input: &str) -> IResult<&str, usize> {
    map_res(take_while_m_n(1, 1, |c: char| c.is_ascii_digit()), |s: &str| {
        s.parse::<usize>()
    })(input)
}

struct FrameLine {
    id: u32,
    extended: bool,
    remote: bool,
    dlc: usize,
    data: Vec<u8>,
}

// tIIIL<data>, TIIIIIIIIL<data>, rIIIL, RIIIIIIIIL; a trailing timestamp is ignored
fn frame_line(input: &str) -> IResult<&str, FrameLine> {
    let (input, kind) = one_of("tTrR")(input)?;
    let extended = matches!(kind, 'T' | 'R');
    let remote = matches!(kind, 'r' | 'R');
    let (input, id) = hex_value(if extended { 8 } else { 3 })(input)?;
    let (input, dlc) = dlc_digit(input)?;
    let (input, data) = if remote || dlc > MAX_DLC {
        (input, Vec::new())
    } else {
        count(hex_byte, dlc)(input)?
    };

    Ok((
        input,
        FrameLine {
            id,
            extended,
            remote,
            dlc,
            data,
        },
    ))
}

/// Parse one received frame line (without its `\r`)
pub fn parse_frame(line: &str) -> Result<CanFrame, TransportError> {
    let (_, parsed) = frame_line(line)
        .map_err(|e| TransportError::Framing(format!("{:?}: {}", line, e)))?;
    CanFrame::from_raw_parts(parsed.id, parsed.extended, parsed.remote, parsed.dlc, &parsed.data)
}

/// Encode one frame as a transmit command
pub fn encode_frame(frame: &CanFrame) -> String {
    Transmit(frame).to_string()
}

/// CAN transport over an slcan adapter
pub struct SlcanTransport<S> {
    stream: S,
    /// Bytes read but not yet terminated
    rx_buf: Vec<u8>,
    /// Whether the channel is open
    open: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> SlcanTransport<S> {
    /// Configure the bitrate and open the CAN channel
    pub async fn open(mut stream: S, bitrate: Bitrate) -> Result<Self, TransportError> {
        // Close first in case the adapter was left open by a previous session
        let setup = format!("C\rS{}\rO\r", bitrate as u8);
        stream.write_all(setup.as_bytes()).await?;
        stream.flush().await?;

        info!("slcan channel opened at {:?}", bitrate);

        Ok(Self {
            stream,
            rx_buf: Vec::with_capacity(MAX_PENDING_BYTES),
            open: true,
        })
    }

    /// Close the CAN channel
    pub async fn close(&mut self) -> Result<(), TransportError> {
        if self.open {
            info!("Closing slcan channel");
            self.open = false;
            self.stream.write_all(b"C\r").await?;
            self.stream.flush().await?;
        }
        Ok(())
    }

    /// Consume every complete line in the buffer and keep the newest frame
    fn take_latest(&mut self) -> Option<CanFrame> {
        let mut latest = None;
        let mut dropped = 0usize;

        while let Some(pos) = self
            .rx_buf
            .iter()
            .position(|b| matches!(*b, b'\r' | b'\n' | BELL))
        {
            let line: Vec<u8> = self.rx_buf.drain(..=pos).collect();
            let (terminator, body) = match line.split_last() {
                Some((t, body)) => (*t, body),
                None => continue,
            };

            if terminator == BELL {
                warn!("slcan adapter reported an error");
                continue;
            }

            match body.first() {
                None => continue,
                // transmit acknowledgements
                Some(b'z') | Some(b'Z') => continue,
                Some(b't') | Some(b'T') | Some(b'r') | Some(b'R') => {}
                Some(_) => {
                    debug!("Ignoring slcan reply {:?}", String::from_utf8_lossy(body));
                    continue;
                }
            }

            let parsed = std::str::from_utf8(body)
                .map_err(|e| TransportError::Framing(e.to_string()))
                .and_then(parse_frame);
            match parsed {
                Ok(frame) => {
                    if latest.replace(frame).is_some() {
                        dropped += 1;
                    }
                }
                Err(e) => warn!("Discarding slcan line: {}", e),
            }
        }

        if self.rx_buf.len() > MAX_PENDING_BYTES {
            warn!("Discarding {} unterminated slcan bytes", self.rx_buf.len());
            self.rx_buf.clear();
        }
        if dropped > 0 {
            trace!("slcan receive dropped {} older frame(s)", dropped);
        }
        latest
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> CanTransport for SlcanTransport<S> {
    fn is_ready(&self) -> bool {
        self.open
    }

    async fn send(&mut self, frame: &CanFrame) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotReady);
        }
        let line = encode_frame(frame);
        trace!("slcan tx {}", line.trim_end());
        self.stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        self.stream
            .flush()
            .await
            .map_err(|e| TransportError::Rejected(e.to_string()))
    }

    async fn receive(&mut self, timeout: Duration) -> Result<CanFrame, TransportError> {
        if !self.open {
            return Err(TransportError::NotReady);
        }

        let deadline = Instant::now()
            .checked_add(timeout)
            .ok_or(TransportError::InvalidTimeout(timeout))?;
        let mut chunk = [0u8; 64];

        loop {
            if let Some(frame) = self.take_latest() {
                return Ok(frame);
            }

            match tokio::time::timeout_at(deadline, self.stream.read(&mut chunk)).await {
                Err(_) => return Err(TransportError::Timeout(timeout.as_millis() as u64)),
                Ok(Ok(0)) => {
                    self.open = false;
                    return Err(TransportError::Io("slcan stream closed".to_string()));
                }
                Ok(Ok(n)) => self.rx_buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }
}

/// Open an slcan adapter on a serial device
pub async fn open_serial(
    device: &str,
    baud_rate: u32,
    bitrate: Bitrate,
) -> Result<SlcanTransport<SerialStream>, TransportError> {
    info!("Opening slcan adapter on {} at {} baud", device, baud_rate);
    let stream = tokio_serial::new(device, baud_rate)
        .open_native_async()
        .map_err(|e| TransportError::Io(format!("{}: {}", device, e)))?;
    SlcanTransport::open(stream, bitrate).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    async fn open_pair() -> (SlcanTransport<DuplexStream>, DuplexStream) {
        let (host, mut adapter) = duplex(256);
        let transport = SlcanTransport::open(host, Bitrate::Rate500kbit).await.unwrap();
        let mut setup = [0u8; 7];
        adapter.read_exact(&mut setup).await.unwrap();
        assert_eq!(&setup, b"C\rS6\rO\r");
        (transport, adapter)
    }

    #[test]
    fn test_encode_frames() {
        let frame = CanFrame::new_standard(0x7DF, &[0x02, 0x01, 0x0C, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(encode_frame(&frame), "t7DF802010C0000000000\r");

        let frame = CanFrame::new_extended(0x12ABCDEF, &[0xAA, 0x55]).unwrap();
        assert_eq!(encode_frame(&frame), "T12ABCDEF2AA55\r");

        let frame = CanFrame::from_raw_parts(0x123, false, true, 0, &[]).unwrap();
        assert_eq!(encode_frame(&frame), "r1230\r");
    }

    #[test]
    fn test_parse_frames() {
        let frame = parse_frame("t7E8803410C1AF8000000").unwrap();
        assert_eq!(frame.raw_id(), 0x7E8);
        assert_eq!(frame.payload(), &[0x03, 0x41, 0x0C, 0x1A, 0xF8, 0, 0, 0]);

        let frame = parse_frame("T18DAF1104034105AD").unwrap();
        assert!(frame.is_extended());
        assert_eq!(frame.raw_id(), 0x18DAF110);
        assert_eq!(frame.payload(), &[0x03, 0x41, 0x05, 0xAD]);

        // trailing timestamp
        let frame = parse_frame("t7E930341111A2B").unwrap();
        assert_eq!(frame.payload(), &[0x03, 0x41, 0x11]);

        let frame = parse_frame("r7E84").unwrap();
        assert!(frame.is_remote());
        assert_eq!(frame.len(), 4);
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        assert!(matches!(parse_frame("t7E"), Err(TransportError::Framing(_))));
        assert!(matches!(parse_frame("t7E8303410"), Err(TransportError::Framing(_))));
        assert_eq!(parse_frame("t7E89"), Err(TransportError::InvalidLength(9)));
        assert_eq!(parse_frame("t8001AA"), Err(TransportError::InvalidId(0x800)));
    }

    #[test]
    fn test_bitrate_codes() {
        assert_eq!(Bitrate::from_kbps(500), Some(Bitrate::Rate500kbit));
        assert_eq!(Bitrate::from_kbps(1000), Some(Bitrate::Rate1000kbit));
        assert_eq!(Bitrate::from_kbps(333), None);
        assert_eq!(Bitrate::default() as u8, 6);
    }

    #[tokio::test]
    async fn test_send_writes_transmit_command() {
        let (mut transport, mut adapter) = open_pair().await;
        let frame = CanFrame::new_standard(0x7DF, &[0x02, 0x01, 0x0D, 0, 0, 0, 0, 0]).unwrap();
        transport.send(&frame).await.unwrap();

        let mut line = [0u8; 22];
        adapter.read_exact(&mut line).await.unwrap();
        assert_eq!(&line, b"t7DF802010D0000000000\r");
    }

    #[tokio::test]
    async fn test_receive_skips_acks_and_keeps_latest() {
        let (mut transport, mut adapter) = open_pair().await;
        adapter
            .write_all(b"\rz\rt7E8803410D1000000000\r\x07t7E8803410D5000000000\r")
            .await
            .unwrap();

        let frame = transport.receive(Duration::from_millis(100)).await.unwrap();
        assert_eq!(frame.payload()[3], 0x50);
    }

    #[tokio::test]
    async fn test_receive_reassembles_split_lines() {
        let (mut transport, mut adapter) = open_pair().await;
        adapter.write_all(b"t7E88034105").await.unwrap();
        let pending = tokio::spawn(async move {
            let frame = transport.receive(Duration::from_millis(500)).await;
            (transport, frame)
        });
        adapter.write_all(b"7D00000000\r").await.unwrap();

        let (_, frame) = pending.await.unwrap();
        assert_eq!(frame.unwrap().payload(), &[0x03, 0x41, 0x05, 0x7D, 0, 0, 0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_timeout_and_close() {
        let (mut transport, mut adapter) = open_pair().await;
        assert_eq!(
            transport.receive(Duration::from_millis(50)).await,
            Err(TransportError::Timeout(50))
        );

        transport.close().await.unwrap();
        assert!(!transport.is_ready());
        let mut close = [0u8; 2];
        adapter.read_exact(&mut close).await.unwrap();
        assert_eq!(&close, b"C\r");
        assert_eq!(
            transport.send(&CanFrame::new_standard(0x7DF, &[]).unwrap()).await,
            Err(TransportError::NotReady)
        );
    }

    #[tokio::test]
    async fn test_receive_rejects_unbounded_timeout() {
        let (mut transport, _adapter) = open_pair().await;
        assert_eq!(
            transport.receive(Duration::MAX).await,
            Err(TransportError::InvalidTimeout(Duration::MAX))
        );
        assert!(transport.is_ready());
    }
}
