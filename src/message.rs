//! Wire protocol: message header, operation head, and the frame codec
//! binding them together over any reliable byte stream.
//!
//! A frame on the wire is: a 4-byte little-endian length prefix, that
//! many bytes of a JSON-encoded [`MessageHeader`], a 4-byte little-endian
//! `data_length`, and finally exactly `data_length` raw payload bytes.
//! Zero-length payloads are legal and round-trip with no trailing bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::geometry::{FileLayout, StripeId, StripeUnitId};

/// Which subsystem a message belongs to, carried in every header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProtocolId {
    /// Storage protocol: client/participant stripe-unit I/O.
    Spn = 0,
    /// Storage back-channel: coordinator-to-client status notification.
    SpnBc = 1,
    /// Control protocol.
    Cpn = 2,
    /// Metadata-server protocol surface.
    Pnfs = 3,
    /// Data-server control channel.
    Dsc = 4,
    /// Internal task dispatch (used for loopback/testing only).
    Task = 5,
    /// Cluster coordination protocol: the three-phase commit messages.
    Ccc = 6,
}

impl ProtocolId {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Self::Spn,
            1 => Self::SpnBc,
            2 => Self::Cpn,
            3 => Self::Pnfs,
            4 => Self::Dsc,
            5 => Self::Task,
            6 => Self::Ccc,
            other => return Err(Error::UnknownProtocolId(other)),
        })
    }
}

/// The specific message within a protocol — mirrors the original
/// dispatch's task-type discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    WriteStripeUnit,
    WriteFullStripe,
    DirectWriteStripeUnit,
    ReadStripeUnit,
    Received,
    Prepare,
    CanCommit,
    StripeWriteCanCommit,
    DoCommit,
    Committed,
    Result,
    PingPong,
    EndpointRegister,
    MaintenanceGc,
}

/// High-level kind of operation an `OpHead` belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    ClientWrite,
    ClientRead,
    Participant,
    PrimaryCoordinator,
}

/// State of an operation's FSM, shared by every operation kind that
/// carries an `OpHead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpStatus {
    Init,
    Prepare,
    CanCommit,
    DoCommit,
    Committed,
    Success,
    Failure,
    ClientInit,
    ClientSent,
    ClientFailure,
    ClientSuccess,
    ClientIntermediateAlpha,
}

/// Cluster-wide unique operation identifier: a client session combined
/// with a per-client monotonic sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CcoId {
    pub client_session_id: u64,
    pub sequence_number: u32,
}

impl CcoId {
    pub fn new(client_session_id: u64, sequence_number: u32) -> Self {
        Self {
            client_session_id,
            sequence_number,
        }
    }
}

/// Common head carried by every operation kind and by every message
/// exchanged between participants and coordinators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpHead {
    pub cco_id: CcoId,
    pub inum: u64,
    pub offset: u64,
    pub length: u64,
    pub op_type: OpType,
    pub subtype: u8,
    pub stripe_count: u32,
    pub status: OpStatus,
    pub file_layout: FileLayout,
    /// Ids of every data unit participating in this stripe's operation —
    /// every data unit in the group for a full-stripe write, or just the
    /// one unit touched by a partial write. The coordinator's
    /// expected-participants bitmap is built from this list directly, so
    /// it is correct regardless of which units it names (never assumed
    /// to be the group's low, zero-based units).
    pub participant_units: Vec<StripeUnitId>,
    /// Which unit this particular message instance reports for or was
    /// sent on behalf of. Set by whichever hop last touched the message;
    /// unused (left at 0) before a unit has been assigned.
    pub unit: StripeUnitId,
    /// The version allocated for `unit`'s contribution, carried alongside
    /// `CanCommit`/`DoCommit` payloads. Unset (0) before a participant
    /// has allocated one.
    pub version: u32,
}

/// Fixed-prefix message header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    pub protocol_id: ProtocolId,
    pub message_type: MessageType,
    pub sequence_number: u32,
    pub created_at_unix_ms: i64,
    pub op_head: OpHead,
    pub stripe_id: StripeId,
}

/// A complete message: header plus its trailing data block.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: MessageHeader,
    pub data: Bytes,
}

impl Message {
    pub fn new(header: MessageHeader, data: Bytes) -> Self {
        Self { header, data }
    }
}

/// `tokio_util::codec` `Encoder`/`Decoder` pair implementing the frame
/// format described at module level.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

const LEN_PREFIX_BYTES: usize = 4;

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        let header_bytes = serde_json::to_vec(&msg.header)?;
        dst.reserve(LEN_PREFIX_BYTES + header_bytes.len() + LEN_PREFIX_BYTES + msg.data.len());
        dst.put_u32_le(header_bytes.len() as u32);
        dst.put_slice(&header_bytes);
        dst.put_u32_le(msg.data.len() as u32);
        dst.put_slice(&msg.data);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < LEN_PREFIX_BYTES {
            return Ok(None);
        }
        let header_len = u32::from_le_bytes(src[..LEN_PREFIX_BYTES].try_into().unwrap()) as usize;
        let header_end = LEN_PREFIX_BYTES + header_len;
        if src.len() < header_end + LEN_PREFIX_BYTES {
            return Ok(None);
        }
        let data_len = u32::from_le_bytes(
            src[header_end..header_end + LEN_PREFIX_BYTES]
                .try_into()
                .unwrap(),
        ) as usize;
        let total = header_end + LEN_PREFIX_BYTES + data_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX_BYTES);
        let header_bytes = src.split_to(header_len);
        let header: MessageHeader = serde_json::from_slice(&header_bytes)
            .map_err(|e| Error::MessageMalformed(e.to_string()))?;
        src.advance(LEN_PREFIX_BYTES);
        let data = src.split_to(data_len).freeze();

        Ok(Some(Message { header, data }))
    }
}
