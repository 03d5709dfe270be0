//! Error types for NetRAID

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur anywhere in a NetRAID node
#[derive(Error, Debug)]
#[allow(dead_code)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    // =========================================================================
    // Layout / geometry errors
    // =========================================================================
    /// Group size does not evenly divide the server count
    #[error("group size {group_size} does not evenly divide server count {server_count}")]
    InvalidLayout { group_size: u8, server_count: u8 },

    /// Stripe unit size of zero was supplied
    #[error("stripe unit size must be nonzero")]
    ZeroStripeUnit,

    /// Offset falls outside the addressable range of the file layout
    #[error("offset {offset} exceeds file layout bounds")]
    OffsetOutOfRange { offset: u64 },

    /// Server id referenced is not part of this file layout
    #[error("server id {0} is not a member of this file layout")]
    UnknownServer(u16),

    // =========================================================================
    // Block store errors
    // =========================================================================
    /// Disk I/O error with path context
    #[error("disk I/O error at {path}: {source}")]
    DiskIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No on-disk block exists for the requested stripe
    #[error("no block found for inode {inum} stripe {stripe_id}")]
    BlockNotFound { inum: u64, stripe_id: u32 },

    /// Stored block failed its checksum verification on read
    #[error("checksum mismatch for inode {inum} stripe {stripe_id} version {version}")]
    ChecksumMismatch {
        inum: u64,
        stripe_id: u32,
        version: u32,
    },

    /// Block file on disk was shorter or otherwise malformed relative to its header
    #[error("malformed block at {path}")]
    MalformedBlock { path: PathBuf },

    // =========================================================================
    // Cache / version-vector errors
    // =========================================================================
    /// Cache has no entry for the requested inode
    #[error("unknown inode {0}")]
    UnknownInode(u64),

    /// A caller-observed version does not match the cache's notion of current
    #[error(
        "version vector inconsistency for inode {inum} stripe {stripe_id}: expected {expected}, got {got}"
    )]
    VersionInconsistency {
        inum: u64,
        stripe_id: u32,
        expected: u32,
        got: u32,
    },

    /// Version vector slot index out of range for the configured group size
    #[error("version vector index {index} out of range for group size {group_size}")]
    VersionIndexOutOfRange { index: u8, group_size: u8 },

    // =========================================================================
    // Wire protocol / transport errors
    // =========================================================================
    /// Transport-level failure talking to a peer server
    #[error("transport error talking to server {server_id}: {source}")]
    Transport {
        server_id: u16,
        #[source]
        source: std::io::Error,
    },

    /// Frame failed to decode into a well-formed message
    #[error("message malformed: {0}")]
    MessageMalformed(String),

    /// Unrecognized protocol id byte in a message header
    #[error("unknown protocol id {0}")]
    UnknownProtocolId(u8),

    /// Unrecognized message type for a given protocol
    #[error("unknown message type {0} for protocol {1}")]
    UnknownMessageType(u16, u8),

    /// Peer closed the connection mid-exchange
    #[error("connection to server {0} closed")]
    ConnectionClosed(u16),

    // =========================================================================
    // Operation state machine errors
    // =========================================================================
    /// Referenced cluster-wide operation id has no tracked operation
    #[error("no such operation {csid}:{seq}")]
    NoSuchOperation { csid: u64, seq: u32 },

    /// Operation did not reach its next state within the allotted deadline
    #[error("operation {csid}:{seq} timed out in state {state}")]
    OperationTimeout {
        csid: u64,
        seq: u32,
        state: &'static str,
    },

    /// A message arrived for an operation that is not in a state that expects it
    #[error("operation {csid}:{seq} received message in unexpected state {state}")]
    UnexpectedState {
        csid: u64,
        seq: u32,
        state: &'static str,
    },

    /// Operation was explicitly aborted
    #[error("operation {csid}:{seq} aborted: {reason}")]
    OperationAborted { csid: u64, seq: u32, reason: String },

    // =========================================================================
    // Configuration errors
    // =========================================================================
    /// Supplied configuration failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
