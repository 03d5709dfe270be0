//! Node: owns every per-server resource and drives the commit protocol.
//!
//! Replaces the original's `DataServer` singleton and its free-standing
//! globals (`p_queue_*`, the inode→`StripeManager` map, the connection
//! table) with one explicitly owned value. `main.rs` constructs exactly
//! one `Node`, spawns its background loops, and hands it to the
//! listener accept loop and the dispatch workers.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use crate::cache::DataObjectCache;
use crate::config::NodeConfig;
use crate::dispatch::{self, Dispatcher, QueueKind};
use crate::error::{Error, Result};
use crate::geometry::{CoordinatorRole, FileLayout, ServerId};
use crate::message::{CcoId, Message, MessageType};
use crate::op::coordinator::PrimaryCoordinatorOperation;
use crate::op::participant::ParticipantOperation;
use crate::op::{Participants, StripeManager};
use crate::parity;
use crate::store::{Block, BlockMetadata, BlockStore};
use crate::transport::ConnectionPool;

/// Everything a single NetRAID server process owns.
pub struct Node {
    pub config: NodeConfig,
    pub store: BlockStore,
    pub cache: DataObjectCache,
    pub connections: ConnectionPool,
    pub dispatcher: Dispatcher,
    stripe_managers: DashMap<u64, Arc<StripeManager>>,
    /// Original write bytes staged between a participant receiving
    /// `WriteStripeUnit`/`WriteFullStripe` and the coordinator's
    /// `DoCommit` telling it which version to write them under.
    pending_payloads: DashMap<CcoId, Vec<u8>>,
}

impl Node {
    pub async fn new(
        config: NodeConfig,
        peers: HashMap<ServerId, std::net::SocketAddr>,
        dispatcher: Dispatcher,
    ) -> Result<Arc<Self>> {
        let store = BlockStore::open(&config.storage, config.server_id, config.fsync).await?;
        Ok(Arc::new(Self {
            config,
            store,
            cache: DataObjectCache::new(),
            connections: ConnectionPool::new(peers),
            dispatcher,
            stripe_managers: DashMap::new(),
            pending_payloads: DashMap::new(),
        }))
    }

    pub fn stripe_manager(&self, inum: u64) -> Arc<StripeManager> {
        self.stripe_managers
            .entry(inum)
            .or_insert_with(|| Arc::new(StripeManager::new(inum)))
            .clone()
    }

    /// Drops stripe managers with no in-flight operations, preventing
    /// the per-inode arena table from growing without bound across the
    /// node's lifetime.
    pub fn reap_idle_stripe_managers(&self) {
        self.stripe_managers.retain(|_, mgr| !mgr.is_idle());
    }

    /// Spawns the garbage-collection and watchdog background loops,
    /// mirroring `couchestor::ec::stripe_manager::StripeManager::run`'s
    /// `tokio::time::interval` pattern and the original's
    /// `timer_watchdog`, respectively.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let gc_node = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gc_node.config.gc_interval);
            loop {
                ticker.tick().await;
                match gc_node.cache.garbage_collection(&gc_node.store).await {
                    Ok(pruned) if pruned > 0 => debug!(pruned, "garbage collection pass"),
                    Ok(_) => {}
                    Err(err) => warn!(%err, "garbage collection pass failed"),
                }
            }
        });

        let watchdog_node = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(watchdog_node.config.watchdog_interval);
            loop {
                ticker.tick().await;
                watchdog_node.run_watchdog_sweep().await;
                watchdog_node.reap_idle_stripe_managers();
            }
        });
    }

    async fn run_watchdog_sweep(&self) {
        use crate::op::participant::OPERATION_TIMEOUT_LEVEL_A;
        for entry in self.stripe_managers.iter() {
            let timed_out = entry.value().timeout_check(OPERATION_TIMEOUT_LEVEL_A);
            for id in timed_out {
                warn!(
                    inum = entry.key(),
                    csid = id.client_session_id,
                    seq = id.sequence_number,
                    "failing timed-out coordinator operation"
                );
            }
        }
    }

    /// Determines this node's role for the given layout and offset.
    pub fn role_for(&self, layout: &FileLayout, offset: u64) -> Result<CoordinatorRole> {
        layout.role_of(self.config.server_id, offset)
    }

    /// Handles a participant's `Received` arriving at this node acting
    /// as primary coordinator for the stripe. Returns the messages to
    /// broadcast next (empty until every participant has reported).
    #[instrument(skip(self, layout))]
    pub async fn on_coordinator_received(
        &self,
        inum: u64,
        cco_id: CcoId,
        layout: &FileLayout,
        stripe_id: crate::geometry::StripeId,
        unit: crate::geometry::StripeUnitId,
        op_head: crate::message::OpHead,
    ) -> Result<bool> {
        let mgr = self.stripe_manager(inum);
        if !mgr.has_coordinator(cco_id) {
            let participants = Participants::from_units(&op_head.participant_units);
            mgr.insert_coordinator(
                cco_id,
                PrimaryCoordinatorOperation::new(cco_id, op_head, participants),
            );
        }
        let should_broadcast_prepare = mgr.with_coordinator(cco_id, |op| op.on_received(unit))?;
        let _ = (stripe_id, layout);
        Ok(should_broadcast_prepare)
    }

    /// Handles a participant's `CanCommit`. When the last piece arrives,
    /// persists the new parity block and returns the version vector to
    /// broadcast with `DoCommit`.
    #[instrument(skip(self, piece))]
    pub async fn on_coordinator_can_commit(
        &self,
        inum: u64,
        cco_id: CcoId,
        stripe_id: crate::geometry::StripeId,
        group_size: u8,
        unit: crate::geometry::StripeUnitId,
        version: u32,
        piece: Vec<u8>,
    ) -> Result<Option<Vec<u32>>> {
        let mgr = self.stripe_manager(inum);
        let existing = self.store.read_stripe_current(inum, stripe_id).await.ok().flatten();
        let existing_data = existing.as_ref().map(|b| b.data.as_slice());

        let final_parity = mgr.with_coordinator(cco_id, |op| {
            op.on_can_commit(unit, version, piece, existing_data)
        })??;

        let Some(final_parity) = final_parity else {
            return Ok(None);
        };

        let mut caller_vector = vec![0u32; group_size as usize];
        self.cache.next_version_vector(
            inum,
            stripe_id,
            group_size,
            group_size - 1,
            &mut caller_vector,
        )?;
        let my_parity_version = caller_vector[group_size as usize - 1];

        let version_vector = mgr.with_coordinator(cco_id, |op| {
            op.allocated_parity_version = Some(my_parity_version);
            op.build_version_vector(group_size, my_parity_version)
        })?;

        let metadata = BlockMetadata {
            client_session_id: cco_id.client_session_id,
            sequence_number: cco_id.sequence_number,
            offset: 0,
            operation_length: final_parity.len() as u64,
            version_vector: version_vector.clone(),
            data_length: final_parity.len() as u64,
        };
        let block = Block::new(metadata, final_parity);
        self.store
            .write_block(inum, stripe_id, my_parity_version, &block)
            .await?;
        self.cache
            .parity_unconfirmed(inum, stripe_id, group_size, my_parity_version, block);

        Ok(Some(version_vector))
    }

    /// Handles a participant's `Committed`; once every participant has
    /// committed, promotes the parity block and reports success.
    #[instrument(skip(self))]
    pub async fn on_coordinator_committed(
        &self,
        inum: u64,
        cco_id: CcoId,
        stripe_id: crate::geometry::StripeId,
        group_size: u8,
        unit: crate::geometry::StripeUnitId,
    ) -> Result<bool> {
        let mgr = self.stripe_manager(inum);
        let all_committed = mgr.with_coordinator(cco_id, |op| op.on_committed(unit))??;
        if all_committed {
            let my_parity_version =
                mgr.with_coordinator(cco_id, |op| op.allocated_parity_version)?;
            if let Some(version) = my_parity_version {
                self.cache
                    .parity_confirm(inum, stripe_id, group_size, version)?;
            }
            mgr.with_coordinator(cco_id, |op| op.finish(true))?;
        }
        Ok(all_committed)
    }

    /// Participant-side: computes this unit's parity contribution from
    /// the new data and whatever block is currently cached, registering
    /// a participant operation if one does not already exist.
    #[instrument(skip(self, new_data))]
    pub async fn participant_can_commit(
        &self,
        inum: u64,
        cco_id: CcoId,
        stripe_id: crate::geometry::StripeId,
        group_size: u8,
        unit: crate::geometry::StripeUnitId,
        primary_coordinator: ServerId,
        op_head: crate::message::OpHead,
        new_data: &[u8],
        is_full_stripe: bool,
    ) -> Result<(Vec<u8>, u32)> {
        let mgr = self.stripe_manager(inum);
        let existing = self.cache.get_current(inum, stripe_id, group_size);
        let participants = Participants::from_units(&op_head.participant_units);

        mgr.insert_participant(
            cco_id,
            ParticipantOperation::new(cco_id, op_head, unit, primary_coordinator, participants, is_full_stripe),
        );

        let mut vector = vec![0u32; group_size as usize];
        self.cache
            .next_version_vector(inum, stripe_id, group_size, unit, &mut vector)?;
        let next_version = vector[unit as usize];

        let existing_data = existing.as_ref().map(|b| b.data.as_slice());
        let piece = mgr.with_participant(cco_id, |op| {
            if !is_full_stripe {
                op.on_prepare()?;
            }
            op.compute_can_commit(next_version, new_data, existing_data)
        })??;

        let _ = parity::checksum(new_data);
        Ok((piece, next_version))
    }

    /// Fetches the piece and version a participant already computed for
    /// `cco_id` (and the coordinator it should report to), for use once
    /// `Prepare` arrives and the cached `CanCommit` is ready to send.
    pub fn participant_pending_commit(
        &self,
        inum: u64,
        cco_id: CcoId,
    ) -> Result<(Vec<u8>, u32, bool, ServerId)> {
        let mgr = self.stripe_manager(inum);
        mgr.with_participant(cco_id, |op| {
            let piece = op.parity_piece.clone().ok_or(Error::UnexpectedState {
                csid: cco_id.client_session_id,
                seq: cco_id.sequence_number,
                state: "no_commit_payload",
            })?;
            let version = op.allocated_version.ok_or(Error::UnexpectedState {
                csid: cco_id.client_session_id,
                seq: cco_id.sequence_number,
                state: "no_commit_payload",
            })?;
            Ok((piece, version, op.is_full_stripe, op.primary_coordinator))
        })?
    }

    /// Looks up the coordinator a participant registered itself against,
    /// for sending `Committed` once its own disk write finishes.
    pub fn participant_coordinator(&self, inum: u64, cco_id: CcoId) -> Result<ServerId> {
        self.stripe_manager(inum)
            .with_participant(cco_id, |op| op.primary_coordinator)
    }

    /// Stages the raw bytes of an inbound write until the coordinator's
    /// `DoCommit` names the version to write them under.
    pub fn stage_payload(&self, cco_id: CcoId, data: Vec<u8>) {
        self.pending_payloads.insert(cco_id, data);
    }

    /// Takes back a payload staged by [`Self::stage_payload`].
    pub fn take_payload(&self, cco_id: CcoId) -> Result<Vec<u8>> {
        self.pending_payloads
            .remove(&cco_id)
            .map(|(_, data)| data)
            .ok_or(Error::NoSuchOperation {
                csid: cco_id.client_session_id,
                seq: cco_id.sequence_number,
            })
    }

    /// Reads the current block for `(inum, stripe_id)`, preferring the
    /// in-memory cache over a disk read, and packages it the way a
    /// `ReadStripeUnit` reply would.
    #[instrument(skip(self))]
    pub async fn serve_read(
        &self,
        inum: u64,
        stripe_id: crate::geometry::StripeId,
        group_size: u8,
        unit: crate::geometry::StripeUnitId,
    ) -> Result<crate::op::client::ReadUnitResponse> {
        let block = match self.cache.get_current(inum, stripe_id, group_size) {
            Some(block) => block,
            None => self
                .store
                .read_stripe_current(inum, stripe_id)
                .await?
                .ok_or(Error::BlockNotFound { inum, stripe_id })?,
        };
        let checksum = parity::checksum(&block.data);
        Ok(crate::op::client::ReadUnitResponse {
            stripe_id,
            unit_id: unit,
            data: block.data.clone(),
            version_vector: block.metadata.version_vector.clone(),
            checksum,
            metadata_checksum_input: block.data,
        })
    }

    /// Participant-side: writes the new block to disk once the
    /// coordinator's `DoCommit` arrives, then installs it as current.
    #[instrument(skip(self, data))]
    pub async fn participant_do_commit(
        &self,
        inum: u64,
        cco_id: CcoId,
        stripe_id: crate::geometry::StripeId,
        group_size: u8,
        unit: crate::geometry::StripeUnitId,
        version_vector: Vec<u32>,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<()> {
        let mgr = self.stripe_manager(inum);
        mgr.with_participant(cco_id, |op| op.on_do_commit(&version_vector))??;

        let my_version = version_vector
            .get(unit as usize)
            .copied()
            .ok_or(Error::VersionIndexOutOfRange {
                index: unit,
                group_size,
            })?;

        let metadata = BlockMetadata {
            client_session_id: cco_id.client_session_id,
            sequence_number: cco_id.sequence_number,
            offset,
            operation_length: data.len() as u64,
            version_vector: version_vector.clone(),
            data_length: data.len() as u64,
        };
        let block = Block::new(metadata, data);
        self.store
            .write_block(inum, stripe_id, my_version, &block)
            .await?;
        self.cache
            .set_current(inum, stripe_id, group_size, my_version, block);

        mgr.with_participant(cco_id, |op| op.on_result(true))??;
        Ok(())
    }

    /// Writes `data` directly to the store for `(inum, stripe_id)`,
    /// bypassing the three-phase commit and parity update entirely.
    /// Gated behind `config.direct_write`; exists only to let
    /// `demos/bench.rs` measure raw storage throughput. Never safe on a
    /// path that must tolerate node failure, since parity is left
    /// stale.
    #[instrument(skip(self, data))]
    pub async fn direct_write(
        &self,
        inum: u64,
        stripe_id: crate::geometry::StripeId,
        group_size: u8,
        unit: crate::geometry::StripeUnitId,
        version: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        if !self.config.direct_write {
            return Err(Error::InvalidConfig(
                "direct_write is disabled on this node".into(),
            ));
        }
        let metadata = BlockMetadata {
            client_session_id: 0,
            sequence_number: 0,
            offset: 0,
            operation_length: data.len() as u64,
            version_vector: vec![0u32; group_size as usize],
            data_length: data.len() as u64,
        };
        let block = Block::new(metadata, data);
        self.store
            .write_block(inum, stripe_id, version, &block)
            .await?;
        self.cache
            .set_current(inum, stripe_id, group_size, version, block);
        let _ = unit;
        Ok(())
    }

    /// Submits a decoded inbound message to the appropriate dispatch
    /// queue based on its role in the commit protocol.
    pub async fn enqueue(&self, message: Message) {
        let queue = match message.header.message_type {
            MessageType::Received | MessageType::CanCommit | MessageType::StripeWriteCanCommit => {
                QueueKind::PrimaryReceive
            }
            MessageType::Prepare | MessageType::DoCommit | MessageType::Result => {
                QueueKind::SecondaryReceive
            }
            MessageType::Committed => QueueKind::Realtime,
            MessageType::MaintenanceGc => QueueKind::Maintenance,
            _ => QueueKind::ClientPrimary,
        };
        if !self.dispatcher.submit(queue, message).await {
            warn!("dispatch queue closed, dropping message");
        }
    }
}
