//! Data-object cache.
//!
//! Every server keeps, per `(inum, stripe_id)`, a small in-memory record
//! of the stripe's version vector plus up to three in-flight blocks:
//! `current` (the block this server would serve a read from right now),
//! `unconfirmed` blocks written locally but not yet acknowledged by the
//! primary coordinator's commit, and `confirmed` blocks that arrived out
//! of order and are waiting for their predecessor version to land before
//! they can be promoted.
//!
//! The cache never blocks a reader behind a writer: `current` is always
//! swapped, never mutated in place, so a concurrent read sees either the
//! old or the new block, never a partial one.

use std::collections::BTreeMap;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::geometry::StripeId;
use crate::store::{Block, BlockStore};

/// One stripe's cached state on a single server.
struct StripeEntry {
    /// `group_size` entries, one counter per unit including the parity
    /// slot at the last index.
    version_vector: Vec<u32>,
    current: Option<Block>,
    current_version: u32,
    unconfirmed: BTreeMap<u32, Block>,
    confirmed: BTreeMap<u32, Block>,
    dirty: bool,
}

impl StripeEntry {
    fn new(group_size: u8) -> Self {
        Self {
            version_vector: vec![0; group_size as usize],
            current: None,
            current_version: 0,
            unconfirmed: BTreeMap::new(),
            confirmed: BTreeMap::new(),
            dirty: false,
        }
    }
}

/// Per-server data-object cache, keyed by `(inum, stripe_id)`.
pub struct DataObjectCache {
    entries: DashMap<(u64, StripeId), Mutex<StripeEntry>>,
}

impl Default for DataObjectCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DataObjectCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    fn entry(&self, inum: u64, stripe_id: StripeId, group_size: u8) -> dashmap::mapref::one::Ref<'_, (u64, StripeId), Mutex<StripeEntry>> {
        self.entries
            .entry((inum, stripe_id))
            .or_insert_with(|| Mutex::new(StripeEntry::new(group_size)))
            .downgrade()
    }

    /// Allocates the next version for this server's own unit slot and
    /// merges in any nonzero slots the caller already knows about —
    /// last-writer-wins against a zero, never against another nonzero
    /// value the caller didn't set. Writes the merged vector back into
    /// `caller_vector`.
    #[instrument(skip(self, caller_vector), fields(inum, stripe_id, my_index))]
    pub fn next_version_vector(
        &self,
        inum: u64,
        stripe_id: StripeId,
        group_size: u8,
        my_index: u8,
        caller_vector: &mut Vec<u32>,
    ) -> Result<()> {
        if my_index as usize >= group_size as usize {
            return Err(Error::VersionIndexOutOfRange {
                index: my_index,
                group_size,
            });
        }
        if caller_vector.len() != group_size as usize {
            caller_vector.resize(group_size as usize, 0);
        }
        let entry = self.entry(inum, stripe_id, group_size);
        let mut state = entry.lock();
        state.version_vector[my_index as usize] += 1;
        for i in 0..group_size as usize {
            if i != my_index as usize && caller_vector[i] != 0 {
                state.version_vector[i] = caller_vector[i];
            }
        }
        caller_vector.copy_from_slice(&state.version_vector);
        Ok(())
    }

    /// Returns this server's cached current block for a stripe, if any.
    pub fn get_current(&self, inum: u64, stripe_id: StripeId, group_size: u8) -> Option<Block> {
        let entry = self.entry(inum, stripe_id, group_size);
        let current = entry.lock().current.clone();
        current
    }

    /// Returns the highest-versioned unconfirmed block if one exists,
    /// falling back to the confirmed current block otherwise.
    pub fn get_latest_unconfirmed(
        &self,
        inum: u64,
        stripe_id: StripeId,
        group_size: u8,
    ) -> Option<Block> {
        let entry = self.entry(inum, stripe_id, group_size);
        let state = entry.lock();
        if let Some((_, block)) = state.unconfirmed.iter().next_back() {
            return Some(block.clone());
        }
        state.current.clone()
    }

    /// Replaces the cached current block, marking the entry dirty so a
    /// later garbage-collection pass will revisit it.
    pub fn set_current(&self, inum: u64, stripe_id: StripeId, group_size: u8, version: u32, block: Block) {
        let entry = self.entry(inum, stripe_id, group_size);
        let mut state = entry.lock();
        state.current = Some(block);
        state.current_version = version;
        state.dirty = true;
    }

    /// Records a locally written block that is not yet confirmed by the
    /// primary coordinator, keyed by the version the parity slot will
    /// carry once committed.
    pub fn parity_unconfirmed(
        &self,
        inum: u64,
        stripe_id: StripeId,
        group_size: u8,
        parity_version: u32,
        block: Block,
    ) {
        let entry = self.entry(inum, stripe_id, group_size);
        entry.lock().unconfirmed.insert(parity_version, block);
    }

    /// Confirms that `version` has committed cluster-wide. If it is the
    /// immediate successor of the current version, promotes it (and any
    /// contiguous versions already parked in `confirmed`); otherwise
    /// parks it in `confirmed` to await its turn.
    #[instrument(skip(self), fields(inum, stripe_id, version))]
    pub fn parity_confirm(&self, inum: u64, stripe_id: StripeId, group_size: u8, version: u32) -> Result<()> {
        let entry = self.entry(inum, stripe_id, group_size);
        let mut state = entry.lock();

        if state.current_version + 1 == version {
            let promoted = state
                .unconfirmed
                .remove(&version)
                .ok_or(Error::VersionInconsistency {
                    inum,
                    stripe_id,
                    expected: version,
                    got: 0,
                })?;
            state.current = Some(promoted);
            state.current_version = version;
            state.dirty = true;

            loop {
                let next = state.current_version + 1;
                if let Some(block) = state.confirmed.remove(&next) {
                    state.current = Some(block);
                    state.current_version = next;
                } else {
                    break;
                }
            }
        } else if let Some(block) = state.unconfirmed.remove(&version) {
            state.confirmed.insert(version, block);
        } else {
            debug!("parity_confirm for version with no unconfirmed block; ignoring");
        }
        Ok(())
    }

    /// Walks every dirty, currently-unlocked entry and asks `store` to
    /// prune any on-disk version below the entry's current version. A
    /// stripe entry held by a concurrent writer is skipped for this
    /// pass rather than blocked on.
    pub async fn garbage_collection(&self, store: &BlockStore) -> Result<usize> {
        let mut pruned = 0usize;
        let keys: Vec<(u64, StripeId)> = self.entries.iter().map(|e| *e.key()).collect();
        for (inum, stripe_id) in keys {
            let high_water_mark = {
                let Some(entry) = self.entries.get(&(inum, stripe_id)) else {
                    continue;
                };
                let Some(mut state) = entry.try_lock() else {
                    continue;
                };
                if !state.dirty {
                    continue;
                }
                let high_water_mark = state.current_version;
                state.dirty = false;
                high_water_mark
            };
            pruned += store.prune_below(inum, stripe_id, high_water_mark).await?;
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BlockMetadata;

    fn block(version: u32) -> Block {
        Block::new(
            BlockMetadata {
                client_session_id: 1,
                sequence_number: version,
                offset: 0,
                operation_length: 1,
                version_vector: vec![version, 0, 0, 0],
                data_length: 1,
            },
            vec![version as u8],
        )
    }

    #[test]
    fn next_version_vector_increments_own_slot_and_merges_others() {
        let cache = DataObjectCache::new();
        let mut vector = vec![0u32, 0, 0, 0];
        cache.next_version_vector(1, 0, 4, 2, &mut vector).unwrap();
        assert_eq!(vector, vec![0, 0, 1, 0]);

        let mut incoming = vec![5u32, 0, 0, 9];
        cache.next_version_vector(1, 0, 4, 2, &mut incoming).unwrap();
        // own slot (2) bumps again; slot 0 adopts caller's 5; slot 3 adopts 9.
        assert_eq!(incoming, vec![5, 0, 2, 9]);
    }

    #[test]
    fn rejects_out_of_range_index() {
        let cache = DataObjectCache::new();
        let mut v = vec![0u32; 4];
        let err = cache.next_version_vector(1, 0, 4, 9, &mut v).unwrap_err();
        assert!(matches!(err, Error::VersionIndexOutOfRange { .. }));
    }

    #[test]
    fn parity_confirm_promotes_contiguous_run() {
        let cache = DataObjectCache::new();
        cache.parity_unconfirmed(1, 0, 4, 1, block(1));
        cache.parity_unconfirmed(1, 0, 4, 2, block(2));
        cache.parity_unconfirmed(1, 0, 4, 3, block(3));

        // Confirm out of order: 3 first parks, 2 parks, then 1 promotes
        // everything contiguous.
        cache.parity_confirm(1, 0, 4, 3).unwrap();
        cache.parity_confirm(1, 0, 4, 2).unwrap();
        cache.parity_confirm(1, 0, 4, 1).unwrap();

        let current = cache.get_current(1, 0, 4).unwrap();
        assert_eq!(current.metadata.sequence_number, 3);
    }

    #[test]
    fn get_latest_unconfirmed_prefers_unconfirmed_over_current() {
        let cache = DataObjectCache::new();
        cache.set_current(1, 0, 4, 1, block(1));
        cache.parity_unconfirmed(1, 0, 4, 2, block(2));
        let latest = cache.get_latest_unconfirmed(1, 0, 4).unwrap();
        assert_eq!(latest.metadata.sequence_number, 2);
    }

    #[tokio::test]
    async fn garbage_collection_prunes_dirty_entries_and_clears_flag() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 1, false).await.unwrap();
        for v in 1..=3u32 {
            store
                .write_block(1, 0, v, &block(v))
                .await
                .unwrap();
        }
        let cache = DataObjectCache::new();
        cache.set_current(1, 0, 4, 3, block(3));

        let pruned = cache.garbage_collection(&store).await.unwrap();
        assert_eq!(pruned, 2);
        // second pass finds nothing dirty
        let pruned_again = cache.garbage_collection(&store).await.unwrap();
        assert_eq!(pruned_again, 0);
    }
}
