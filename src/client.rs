//! Client-side entry point: fans a user write or read across the
//! stripes it touches and waits for the servers to report back.
//!
//! Mirrors `original_source/src/netraid/client/Client.cpp`'s role as the
//! thing applications link against, minus the POSIX-filesystem shim
//! layered on top of it there. A `Client` owns its own connection pool
//! and session id; sequence numbers are a per-`Client` counter, since
//! nothing in the wire protocol lets two `Client`s share a `CcoId`
//! namespace safely.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{instrument, warn};

use crate::error::{Error, Result};
use crate::geometry::{FileLayout, ServerId, StripeId, StripeUnitId};
use crate::message::{CcoId, Message, MessageHeader, MessageType, OpHead, OpStatus, OpType, ProtocolId};
use crate::op::client::{
    ClientCompositeWrite, ClientRead, ReadUnitResponse, SubOperationStatus, WriteSubOperation,
    SPN_OPERATION_TIMEOUT,
};
use crate::transport::ConnectionPool;

/// A single reply a server sends back for an outstanding client
/// sub-operation: success/failure for a write unit, or the unit's data
/// plus version metadata for a read unit.
#[derive(Debug, Clone)]
pub enum ClientReply {
    WriteResult { stripe_id: StripeId, success: bool },
    ReadResult(ReadUnitResponse),
}

/// Application-facing handle to the cluster. Thread-safe and cheaply
/// cloneable; every clone shares the same session id, sequence counter,
/// and connection pool.
pub struct Client {
    client_session_id: u64,
    sequence: AtomicU32,
    connections: Arc<ConnectionPool>,
    pending: Arc<DashMap<CcoId, oneshot::Sender<ClientReply>>>,
}

impl Client {
    pub fn new(client_session_id: u64, peers: HashMap<ServerId, std::net::SocketAddr>) -> Self {
        Self {
            client_session_id,
            sequence: AtomicU32::new(1),
            connections: Arc::new(ConnectionPool::new(peers)),
            pending: Arc::new(DashMap::new()),
        }
    }

    fn next_cco_id(&self) -> CcoId {
        CcoId::new(
            self.client_session_id,
            self.sequence.fetch_add(1, Ordering::SeqCst),
        )
    }

    /// Fulfils a pending sub-operation, handed a decoded reply from the
    /// node's accept loop. Replaces `Client.cpp`'s blocking
    /// `recv`-on-socket loop with a one-shot channel the waiter already
    /// holds.
    pub fn deliver(&self, cco_id: CcoId, reply: ClientReply) {
        if let Some((_, tx)) = self.pending.remove(&cco_id) {
            let _ = tx.send(reply);
        }
    }

    /// Writes `data` at `offset` of inode `inum`, fanning the range out
    /// into one sub-operation per stripe it touches and waiting for
    /// every stripe's secondary coordinator to report completion.
    #[instrument(skip(self, layout, data))]
    pub async fn write(&self, layout: &FileLayout, inum: u64, offset: u64, data: &[u8]) -> Result<()> {
        let cco_id = self.next_cco_id();
        let spans = layout.stripes_of(offset, data.len() as u64);
        if spans.is_empty() {
            return Ok(());
        }

        let mut sub_ops = Vec::with_capacity(spans.len());
        let mut waiters = Vec::with_capacity(spans.len());
        for span in &spans {
            let secondary = layout.server_of(span.stripe_id, layout.unit_of(span.start))?;
            let primary = layout.parity_server(span.stripe_id)?;
            sub_ops.push(WriteSubOperation {
                stripe_id: span.stripe_id,
                is_full_stripe: span.is_full,
                secondary_coordinator: secondary,
                primary_coordinator: primary,
                status: SubOperationStatus::Pending,
            });

            let (tx, rx) = oneshot::channel();
            let span_cco = CcoId::new(cco_id.client_session_id, cco_id.sequence_number + span.stripe_id);
            self.pending.insert(span_cco, tx);
            waiters.push((span_cco, rx));

            let payload = data[(span.start - offset) as usize..(span.end - offset) as usize].to_vec();
            let message_type = if span.is_full {
                MessageType::WriteFullStripe
            } else {
                MessageType::WriteStripeUnit
            };
            let unit = layout.unit_of(span.start);
            // A full-stripe write recomputes parity from every data unit in
            // the group; a partial write only ever touches the one unit
            // this span targets, so the coordinator should expect just
            // that unit to report in.
            let participant_units: Vec<StripeUnitId> = if span.is_full {
                (0..layout.data_units_per_group()).collect()
            } else {
                vec![unit]
            };
            let op_head = OpHead {
                cco_id: span_cco,
                inum,
                offset: span.start,
                length: span.end - span.start,
                op_type: OpType::ClientWrite,
                subtype: 0,
                stripe_count: spans.len() as u32,
                status: OpStatus::ClientInit,
                file_layout: layout.clone(),
                participant_units,
                unit,
                version: 0,
            };
            self.send(secondary, message_type, op_head, span.stripe_id, payload)
                .await?;
        }

        let mut write = ClientCompositeWrite::new(cco_id, sub_ops);
        let started = Instant::now();
        for (span_cco, rx) in waiters {
            let remaining = SPN_OPERATION_TIMEOUT.saturating_sub(started.elapsed());
            let reply = tokio::time::timeout(remaining, rx).await;
            match reply {
                Ok(Ok(ClientReply::WriteResult { stripe_id, success })) => {
                    write.mark(stripe_id, if success { SubOperationStatus::Success } else { SubOperationStatus::Failure });
                }
                _ => {
                    self.pending.remove(&span_cco);
                    return Err(Error::OperationTimeout {
                        csid: cco_id.client_session_id,
                        seq: cco_id.sequence_number,
                        state: "client_write",
                    });
                }
            }
        }

        if write.is_success() {
            Ok(())
        } else {
            Err(Error::OperationAborted {
                csid: cco_id.client_session_id,
                seq: cco_id.sequence_number,
                reason: "one or more stripe sub-operations failed".into(),
            })
        }
    }

    /// Reads `length` bytes starting at `offset` of inode `inum`,
    /// fanning out one sub-request per stripe unit in range and
    /// cross-checking version metadata before assembling the result.
    #[instrument(skip(self, layout))]
    pub async fn read(&self, layout: &FileLayout, inum: u64, offset: u64, length: u64) -> Result<Vec<u8>> {
        let cco_id = self.next_cco_id();
        let spans = layout.stripes_of(offset, length);
        if spans.is_empty() {
            return Ok(Vec::new());
        }

        let mut units: Vec<(StripeId, StripeUnitId, ServerId, CcoId, oneshot::Receiver<ClientReply>)> = Vec::new();
        for span in &spans {
            let unit = layout.unit_of(span.start);
            let server = layout.server_of(span.stripe_id, unit)?;
            let unit_cco = CcoId::new(
                cco_id.client_session_id,
                cco_id.sequence_number.wrapping_add(span.stripe_id).wrapping_add(unit as u32),
            );
            let (tx, rx) = oneshot::channel();
            self.pending.insert(unit_cco, tx);

            let op_head = OpHead {
                cco_id: unit_cco,
                inum,
                offset: span.start,
                length: span.end - span.start,
                op_type: OpType::ClientRead,
                subtype: 0,
                stripe_count: spans.len() as u32,
                status: OpStatus::ClientInit,
                file_layout: layout.clone(),
                // Unused on the read path; no coordinator arena is opened.
                participant_units: vec![unit],
                unit,
                version: 0,
            };
            self.send(server, MessageType::ReadStripeUnit, op_head, span.stripe_id, Vec::new())
                .await?;
            units.push((span.stripe_id, unit, server, unit_cco, rx));
        }

        let mut read = ClientRead::new(units.len());
        let started = Instant::now();
        for (_, _, _, unit_cco, rx) in units {
            let remaining = SPN_OPERATION_TIMEOUT.saturating_sub(started.elapsed());
            match tokio::time::timeout(remaining, rx).await {
                Ok(Ok(ClientReply::ReadResult(response))) => read.record(response),
                _ => {
                    self.pending.remove(&unit_cco);
                    return Err(Error::OperationTimeout {
                        csid: cco_id.client_session_id,
                        seq: cco_id.sequence_number,
                        state: "client_read",
                    });
                }
            }
        }

        read.assemble()
    }

    async fn send(
        &self,
        server_id: ServerId,
        message_type: MessageType,
        op_head: OpHead,
        stripe_id: StripeId,
        payload: Vec<u8>,
    ) -> Result<()> {
        let header = MessageHeader {
            protocol_id: ProtocolId::Spn,
            message_type,
            sequence_number: op_head.cco_id.sequence_number,
            created_at_unix_ms: 0,
            op_head,
            stripe_id,
        };
        let message = Message::new(header, Bytes::from(payload));
        if let Err(err) = self.connections.send(server_id, message).await {
            warn!(server_id, %err, "client send failed");
            return Err(err);
        }
        Ok(())
    }
}
