//! Crossbar wire format — the one framed protocol spoken on every link.
//!
//! Every message on the fabric is a single Frame: a fixed 7-byte header
//! followed by either `len` payload bytes (data frame) or exactly one
//! ack-code byte (control frame). The length byte disambiguates the two.
//!
//! The checksum is a single additive byte. It only catches gross
//! corruption; that is all the retransmission machinery needs from it.
//! Decoding preserves the checksum byte found on the wire verbatim, so a
//! corrupted frame stays observably corrupted after a round trip.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Frame header size in bytes.
pub const HEADER_LEN: usize = 7;

/// Fixed frame header, as laid out on the wire.
///
/// Wire size: 7 bytes. All fields are single unsigned bytes; addresses
/// above 255 are out of scope for the fabric.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct FrameHeader {
    pub src_net: u8,
    pub src_node: u8,
    pub dst_net: u8,
    pub dst_node: u8,
    pub seq: u8,
    pub checksum: u8,
    /// Payload length. 0 means control frame: one ack-code byte follows.
    pub len: u8,
}

assert_eq_size!(FrameHeader, [u8; 7]);

// ── Addressing ────────────────────────────────────────────────────────────────

/// A fabric address: network ID plus node ID within that network.
///
/// Zero is reserved in both positions for control traffic. The script and
/// rule loaders refuse zero as a data destination, so a data frame aimed
/// at a reserved address never enters the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Addr {
    pub net: u8,
    pub node: u8,
}

impl Addr {
    /// The reserved control address, `0:0`.
    pub const CONTROL: Addr = Addr { net: 0, node: 0 };

    pub fn new(net: u8, node: u8) -> Self {
        Self { net, node }
    }

    /// True when either component uses the reserved zero value.
    pub fn is_reserved(&self) -> bool {
        self.net == 0 || self.node == 0
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.net, self.node)
    }
}

// ── Ack codes ─────────────────────────────────────────────────────────────────

/// Control-frame discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AckCode {
    /// Firewall distribution is complete; data traffic may begin.
    RulesDone = 1,
    /// Receiver saw a checksum mismatch and dropped the frame.
    NackCrc = 2,
    /// Positive acknowledgement.
    Ok = 3,
    /// A firewall rule blocked the frame; it was not delivered.
    NackFirewall = 4,
    /// The sender has drained its outbound queue.
    Done = 5,
    /// Global teardown: acknowledge, then stop servicing the link.
    Shutdown = 6,
}

impl AckCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::RulesDone),
            2 => Some(Self::NackCrc),
            3 => Some(Self::Ok),
            4 => Some(Self::NackFirewall),
            5 => Some(Self::Done),
            6 => Some(Self::Shutdown),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

// ── Frame ─────────────────────────────────────────────────────────────────────

/// Frame body — exactly one of non-empty payload bytes or a control code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Data(Bytes),
    Control(AckCode),
}

/// The atomic unit exchanged on every fabric link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub src: Addr,
    pub dst: Addr,
    pub seq: u8,
    /// As computed at construction, or as found on the wire at decode
    /// time. Never silently recomputed; compare via [`Frame::checksum_ok`].
    pub checksum: u8,
    pub body: Body,
}

impl Frame {
    /// Build a data frame. The payload must be non-empty and at most 255
    /// bytes; both are enforced where traffic enters the system.
    pub fn data(src: Addr, dst: Addr, seq: u8, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        debug_assert!(!payload.is_empty());
        debug_assert!(payload.len() <= u8::MAX as usize);
        let mut frame = Frame {
            src,
            dst,
            seq,
            checksum: 0,
            body: Body::Data(payload),
        };
        frame.checksum = frame.compute_checksum();
        frame
    }

    /// Build a control frame.
    pub fn control(src: Addr, dst: Addr, seq: u8, code: AckCode) -> Self {
        let mut frame = Frame {
            src,
            dst,
            seq,
            checksum: 0,
            body: Body::Control(code),
        };
        frame.checksum = frame.compute_checksum();
        frame
    }

    pub fn is_data(&self) -> bool {
        matches!(self.body, Body::Data(_))
    }

    pub fn payload(&self) -> Option<&Bytes> {
        match &self.body {
            Body::Data(p) => Some(p),
            Body::Control(_) => None,
        }
    }

    pub fn ack_code(&self) -> Option<AckCode> {
        match &self.body {
            Body::Data(_) => None,
            Body::Control(code) => Some(*code),
        }
    }

    /// Additive checksum: addresses and sequence, plus length and first
    /// payload byte for data frames, or the ack code for control frames.
    pub fn compute_checksum(&self) -> u8 {
        let mut sum = self
            .src
            .net
            .wrapping_add(self.src.node)
            .wrapping_add(self.dst.net)
            .wrapping_add(self.dst.node)
            .wrapping_add(self.seq);
        match &self.body {
            Body::Data(p) => {
                sum = sum.wrapping_add(p.len() as u8).wrapping_add(p[0]);
            }
            Body::Control(code) => {
                sum = sum.wrapping_add(code.as_byte());
            }
        }
        sum
    }

    /// Does the stored checksum match the frame contents?
    pub fn checksum_ok(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// Copy of this frame with a deliberately wrong checksum byte.
    ///
    /// Fault-injection hook for the ARQ loss simulation; the switching
    /// fabric itself never corrupts frames.
    pub fn corrupted(&self) -> Frame {
        let mut frame = self.clone();
        frame.checksum = frame.checksum.wrapping_add(1);
        frame
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Bytes {
        let body_len = match &self.body {
            Body::Data(p) => p.len(),
            Body::Control(_) => 1,
        };
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
        let header = FrameHeader {
            src_net: self.src.net,
            src_node: self.src.node,
            dst_net: self.dst.net,
            dst_node: self.dst.node,
            seq: self.seq,
            checksum: self.checksum,
            len: match &self.body {
                Body::Data(p) => p.len() as u8,
                Body::Control(_) => 0,
            },
        };
        buf.put_slice(header.as_bytes());
        match &self.body {
            Body::Data(p) => buf.put_slice(p),
            Body::Control(code) => buf.put_u8(code.as_byte()),
        }
        buf.freeze()
    }

    /// Parse wire bytes. The buffer must hold exactly one frame.
    ///
    /// The checksum byte is taken from the wire as-is; a mismatch with the
    /// recomputed value is a normal condition for the caller to detect,
    /// not a decode failure.
    pub fn decode(buf: &[u8]) -> Result<Frame, FrameError> {
        let header = FrameHeader::read_from_prefix(buf).ok_or(FrameError::Truncated {
            needed: HEADER_LEN,
            got: buf.len(),
        })?;
        let declared = header.len as usize;
        let total = HEADER_LEN + if declared == 0 { 1 } else { declared };
        if buf.len() < total {
            return Err(FrameError::Truncated {
                needed: total,
                got: buf.len(),
            });
        }
        if buf.len() > total {
            return Err(FrameError::TrailingBytes {
                expected: total,
                got: buf.len(),
            });
        }
        let body = if declared == 0 {
            let code = AckCode::from_byte(buf[HEADER_LEN])
                .ok_or(FrameError::UnknownAckCode(buf[HEADER_LEN]))?;
            Body::Control(code)
        } else {
            Body::Data(Bytes::copy_from_slice(&buf[HEADER_LEN..total]))
        };
        Ok(Frame {
            src: Addr::new(header.src_net, header.src_node),
            dst: Addr::new(header.dst_net, header.dst_node),
            seq: header.seq,
            checksum: header.checksum,
            body,
        })
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.body {
            Body::Data(p) => write!(
                f,
                "[{}→{} seq={} data {}B]",
                self.src,
                self.dst,
                self.seq,
                p.len()
            ),
            Body::Control(code) => {
                write!(f, "[{}→{} seq={} {:?}]", self.src, self.dst, self.seq, code)
            }
        }
    }
}

// ── Stream decoding ───────────────────────────────────────────────────────────

/// Decode one frame from a live byte stream.
///
/// A clean EOF before the first header byte is [`FrameError::Closed`] —
/// the link drained in an orderly way. EOF anywhere after that means the
/// stream died mid-frame and is reported as [`FrameError::Truncated`],
/// which readers recover from by logging and moving on.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header[..1]).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::Closed)
        }
        Err(e) => return Err(FrameError::Io(e)),
    }
    read_fully(reader, &mut header[1..]).await?;

    let declared = header[6] as usize;
    let mut body = vec![0u8; if declared == 0 { 1 } else { declared }];
    read_fully(reader, &mut body).await?;

    let mut raw = Vec::with_capacity(HEADER_LEN + body.len());
    raw.extend_from_slice(&header);
    raw.extend_from_slice(&body);
    Frame::decode(&raw)
}

async fn read_fully<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(FrameError::Truncated {
                needed: buf.len(),
                got: filled,
            });
        }
        filled += n;
    }
    Ok(())
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors from frame decoding.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The stream or buffer ended before a whole frame was available.
    #[error("frame truncated: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    /// Buffer decode only: bytes left over past the declared length.
    #[error("frame over-long: expected {expected} bytes, got {got}")]
    TrailingBytes { expected: usize, got: usize },

    /// Control frame carried a code outside the protocol's set.
    #[error("unknown ack code: 0x{0:02x}")]
    UnknownAckCode(u8),

    /// The peer closed the stream between frames. Orderly, not a loss.
    #[error("stream closed")]
    Closed,

    /// Underlying transport failure.
    #[error("stream I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Recoverable frame loss: the reader logs it and continues, treating
    /// the frame as never having arrived.
    pub fn is_lost(&self) -> bool {
        matches!(
            self,
            FrameError::Truncated { .. }
                | FrameError::TrailingBytes { .. }
                | FrameError::UnknownAckCode(_)
        )
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
