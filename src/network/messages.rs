//! Wire message definitions.
//!
//! A [`Message`] is a two-byte magic header followed by a body whose kind
//! is encoded as a little-endian `i32` discriminant. Length prefixes are
//! checked against protocol caps on decode, so a malicious peer cannot make
//! the receiver allocate unbounded memory.

use crate::wire::{ByteReader, DecodeError, Serde};
use crate::{Frame, MAX_INPUT_PAYLOAD, MAX_NUM_PLAYERS};

/// The connection state of a player as seen by one peer: whether that
/// player has disconnected, and the last frame the peer has a confirmed
/// input for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Whether the player is disconnected.
    pub disconnected: bool,
    /// Last frame a confirmed input exists for.
    pub last_frame: Frame,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            disconnected: false,
            last_frame: Frame::NULL,
        }
    }
}

impl Serde for ConnectionStatus {
    fn serde_size(&self) -> usize {
        1 + self.last_frame.serde_size()
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        self.disconnected.serialize(out);
        self.last_frame.serialize(out);
    }

    fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            disconnected: r.read_bool()?,
            last_frame: Frame::deserialize(r)?,
        })
    }
}

/// First half of a synchronization roundtrip: carries a random nonce the
/// remote must echo back.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct SyncRequest {
    /// Nonce to be echoed in the corresponding [`SyncReply`].
    pub random_request: u32,
}

/// Second half of a synchronization roundtrip.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct SyncReply {
    /// The nonce from the [`SyncRequest`] being answered.
    pub random_reply: u32,
}

/// A batch of compressed inputs together with the sender's view of all
/// players' connection states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    /// The sender's view of every player's connection status.
    pub peer_connect_status: Vec<ConnectionStatus>,
    /// Whether the sender requests a disconnect.
    pub disconnect_requested: bool,
    /// Frame of the first input encoded in `bytes`.
    pub start_frame: Frame,
    /// Highest remote frame the sender has received from us.
    pub ack_frame: Frame,
    /// Compressed input payload, see
    /// [`Compression`](crate::network::compression::Compression).
    pub bytes: Vec<u8>,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            peer_connect_status: Vec::new(),
            disconnect_requested: false,
            start_frame: Frame::NULL,
            ack_frame: Frame::NULL,
            bytes: Vec::new(),
        }
    }
}

impl Serde for Input {
    fn serde_size(&self) -> usize {
        4 + self.peer_connect_status.iter().map(Serde::serde_size).sum::<usize>()
            + 1
            + self.start_frame.serde_size()
            + self.ack_frame.serde_size()
            + 4
            + self.bytes.len()
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        (self.peer_connect_status.len() as i32).serialize(out);
        for status in &self.peer_connect_status {
            status.serialize(out);
        }
        self.disconnect_requested.serialize(out);
        self.start_frame.serialize(out);
        self.ack_frame.serialize(out);
        (self.bytes.len() as i32).serialize(out);
        out.extend_from_slice(&self.bytes);
    }

    fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let num_statuses = r.read_length("connection statuses", MAX_NUM_PLAYERS)?;
        let mut peer_connect_status = Vec::with_capacity(num_statuses);
        for _ in 0..num_statuses {
            peer_connect_status.push(ConnectionStatus::deserialize(r)?);
        }
        let disconnect_requested = r.read_bool()?;
        let start_frame = Frame::deserialize(r)?;
        let ack_frame = Frame::deserialize(r)?;
        let num_bytes = r.read_length("input payload", MAX_INPUT_PAYLOAD)?;
        let bytes = r.read_bytes(num_bytes)?.to_vec();
        Ok(Self {
            peer_connect_status,
            disconnect_requested,
            start_frame,
            ack_frame,
            bytes,
        })
    }
}

/// Acknowledges receipt of inputs up to and including `ack_frame`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InputAck {
    /// Highest frame received from the sender's peer.
    pub ack_frame: Frame,
}

impl Default for InputAck {
    fn default() -> Self {
        Self { ack_frame: Frame::NULL }
    }
}

/// Periodic report of local frame advantage, doubling as a ping probe.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct QualityReport {
    /// Sender's local frame advantage over the receiver, in frames.
    pub frame_advantage: i16,
    /// Sender's wall clock in ms, echoed back by the receiver.
    pub ping: u64,
}

/// Answer to a [`QualityReport`], echoing the probe timestamp.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct QualityReply {
    /// The `ping` value of the report being answered.
    pub pong: u64,
}

/// State checksum for a confirmed frame, used for desync detection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChecksumReport {
    /// Checksum of the sender's state at `frame`.
    pub checksum: u64,
    /// The frame the checksum belongs to.
    pub frame: Frame,
}

impl Default for ChecksumReport {
    fn default() -> Self {
        Self {
            checksum: 0,
            frame: Frame::NULL,
        }
    }
}

/// The body of a [`Message`], discriminated by an `i32` kind on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// See [`SyncRequest`].
    SyncRequest(SyncRequest),
    /// See [`SyncReply`].
    SyncReply(SyncReply),
    /// See [`Input`].
    Input(Input),
    /// See [`InputAck`].
    InputAck(InputAck),
    /// See [`QualityReport`].
    QualityReport(QualityReport),
    /// See [`QualityReply`].
    QualityReply(QualityReply),
    /// See [`ChecksumReport`].
    ChecksumReport(ChecksumReport),
    /// Empty body refreshing the connection liveness timer.
    KeepAlive,
}

impl MessageBody {
    const KIND_SYNC_REQUEST: i32 = 0;
    const KIND_SYNC_REPLY: i32 = 1;
    const KIND_INPUT: i32 = 2;
    const KIND_INPUT_ACK: i32 = 3;
    const KIND_QUALITY_REPORT: i32 = 4;
    const KIND_QUALITY_REPLY: i32 = 5;
    const KIND_CHECKSUM_REPORT: i32 = 6;
    const KIND_KEEP_ALIVE: i32 = 7;

    fn kind(&self) -> i32 {
        match self {
            MessageBody::SyncRequest(_) => Self::KIND_SYNC_REQUEST,
            MessageBody::SyncReply(_) => Self::KIND_SYNC_REPLY,
            MessageBody::Input(_) => Self::KIND_INPUT,
            MessageBody::InputAck(_) => Self::KIND_INPUT_ACK,
            MessageBody::QualityReport(_) => Self::KIND_QUALITY_REPORT,
            MessageBody::QualityReply(_) => Self::KIND_QUALITY_REPLY,
            MessageBody::ChecksumReport(_) => Self::KIND_CHECKSUM_REPORT,
            MessageBody::KeepAlive => Self::KIND_KEEP_ALIVE,
        }
    }
}

impl Serde for MessageBody {
    fn serde_size(&self) -> usize {
        4 + match self {
            MessageBody::SyncRequest(_) | MessageBody::SyncReply(_) => 4,
            MessageBody::Input(input) => input.serde_size(),
            MessageBody::InputAck(ack) => ack.ack_frame.serde_size(),
            MessageBody::QualityReport(_) => 2 + 8,
            MessageBody::QualityReply(_) => 8,
            MessageBody::ChecksumReport(report) => 8 + report.frame.serde_size(),
            MessageBody::KeepAlive => 0,
        }
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        self.kind().serialize(out);
        match self {
            MessageBody::SyncRequest(body) => body.random_request.serialize(out),
            MessageBody::SyncReply(body) => body.random_reply.serialize(out),
            MessageBody::Input(body) => body.serialize(out),
            MessageBody::InputAck(body) => body.ack_frame.serialize(out),
            MessageBody::QualityReport(body) => {
                body.frame_advantage.serialize(out);
                body.ping.serialize(out);
            }
            MessageBody::QualityReply(body) => body.pong.serialize(out),
            MessageBody::ChecksumReport(body) => {
                body.checksum.serialize(out);
                body.frame.serialize(out);
            }
            MessageBody::KeepAlive => {}
        }
    }

    fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let kind = r.read_i32()?;
        Ok(match kind {
            Self::KIND_SYNC_REQUEST => MessageBody::SyncRequest(SyncRequest {
                random_request: r.read_u32()?,
            }),
            Self::KIND_SYNC_REPLY => MessageBody::SyncReply(SyncReply {
                random_reply: r.read_u32()?,
            }),
            Self::KIND_INPUT => MessageBody::Input(Input::deserialize(r)?),
            Self::KIND_INPUT_ACK => MessageBody::InputAck(InputAck {
                ack_frame: Frame::deserialize(r)?,
            }),
            Self::KIND_QUALITY_REPORT => MessageBody::QualityReport(QualityReport {
                frame_advantage: r.read_i16()?,
                ping: r.read_u64()?,
            }),
            Self::KIND_QUALITY_REPLY => MessageBody::QualityReply(QualityReply {
                pong: r.read_u64()?,
            }),
            Self::KIND_CHECKSUM_REPORT => MessageBody::ChecksumReport(ChecksumReport {
                checksum: r.read_u64()?,
                frame: Frame::deserialize(r)?,
            }),
            Self::KIND_KEEP_ALIVE => MessageBody::KeepAlive,
            unknown => return Err(DecodeError::UnknownKind(unknown)),
        })
    }
}

/// Identifies the connection a message belongs to.
///
/// The magic is a random nonzero value chosen by the sender at session
/// start; messages carrying a stale or foreign magic are discarded.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct MessageHeader {
    /// The sender's connection magic.
    pub magic: u16,
}

/// A complete wire message: header plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The message header.
    pub header: MessageHeader,
    /// The message body.
    pub body: MessageBody,
}

impl Serde for Message {
    fn serde_size(&self) -> usize {
        2 + self.body.serde_size()
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        self.header.magic.serialize(out);
        self.body.serialize(out);
    }

    fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            header: MessageHeader {
                magic: r.read_u16()?,
            },
            body: MessageBody::deserialize(r)?,
        })
    }
}
