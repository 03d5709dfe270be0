//! End-to-end scenarios exercising a small in-process cluster: one
//! `Node` per cluster server (own tempdir-backed store, own cache, own
//! operation arena), orchestrated the way `main.rs`'s dispatch worker
//! would, but with the calling test driving each step directly instead
//! of going over real sockets — the client-reply addressing real
//! sockets would need is resolved by an external metadata server this
//! crate does not implement.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use netraid::config::NodeConfig;
use netraid::dispatch;
use netraid::geometry::FileLayout;
use netraid::message::{CcoId, OpHead, OpStatus, OpType};
use netraid::node::Node;

fn layout() -> FileLayout {
    FileLayout::new(4, 4096, vec![0, 1, 2, 3]).unwrap()
}

fn head(cco_id: CcoId, length: u64, participant_units: Vec<u8>) -> OpHead {
    OpHead {
        cco_id,
        inum: 1,
        offset: 0,
        length,
        op_type: OpType::Participant,
        subtype: 0,
        stripe_count: 1,
        status: OpStatus::Init,
        file_layout: layout(),
        participant_units,
        unit: 0,
        version: 0,
    }
}

async fn spawn_node(server_id: u16) -> Arc<Node> {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, _queues) = dispatch::channel();
    Node::new(
        NodeConfig {
            server_id,
            storage: dir.path().to_path_buf(),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            fsync: false,
            gc_interval: Duration::from_secs(3600),
            watchdog_interval: Duration::from_secs(3600),
            direct_write: false,
        },
        HashMap::new(),
        dispatcher,
    )
    .await
    .unwrap()
}

/// Walks one stripe-unit write through the full three-phase commit
/// between `participants` (data servers, one per unit id given) and
/// `coordinator` (the parity server). Returns the version vector
/// broadcast with `DoCommit`.
async fn commit_write(
    coordinator: &Node,
    participants: &[(&Node, u8, Vec<u8>)],
    cco_id: CcoId,
    stripe_id: u32,
    group_size: u8,
) -> Vec<u32> {
    let participant_units: Vec<u8> = participants.iter().map(|(_, unit, _)| *unit).collect();
    let mut pieces = Vec::new();
    for (node, unit, data) in participants {
        let (piece, _version) = node
            .participant_can_commit(
                1,
                cco_id,
                stripe_id,
                group_size,
                *unit,
                3,
                head(cco_id, data.len() as u64, participant_units.clone()),
                data,
                false,
            )
            .await
            .unwrap();
        pieces.push((*unit, piece));
    }

    for (_, unit, _) in participants {
        coordinator
            .on_coordinator_received(
                1,
                cco_id,
                &layout(),
                stripe_id,
                *unit,
                head(cco_id, 0, participant_units.clone()),
            )
            .await
            .unwrap();
    }

    let mut version_vector = None;
    for (unit, piece) in pieces {
        let result = coordinator
            .on_coordinator_can_commit(1, cco_id, stripe_id, group_size, unit, 1, piece)
            .await
            .unwrap();
        if let Some(vector) = result {
            version_vector = Some(vector);
        }
    }
    let version_vector = version_vector.expect("coordinator should finish once every piece arrives");

    for (node, unit, data) in participants {
        node.participant_do_commit(1, cco_id, stripe_id, group_size, *unit, version_vector.clone(), 0, data.clone())
            .await
            .unwrap();
    }

    for (_, unit, _) in participants {
        coordinator
            .on_coordinator_committed(1, cco_id, stripe_id, group_size, *unit)
            .await
            .unwrap();
    }

    version_vector
}

#[tokio::test]
async fn single_stripe_unit_write_then_read() {
    let data = spawn_node(0).await;
    let parity = spawn_node(3).await;
    let cco_id = CcoId::new(1, 1);

    commit_write(&parity, &[(&data, 0, vec![1, 2, 3, 4])], cco_id, 0, 4).await;

    let stored = data.store.read_stripe_current(1, 0).await.unwrap().unwrap();
    assert_eq!(stored.data, vec![1, 2, 3, 4]);

    let parity_block = parity.store.read_stripe_current(1, 0).await.unwrap().unwrap();
    // Single participant: parity equals the data verbatim (XOR against
    // nothing existing).
    assert_eq!(parity_block.data, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn two_unit_write_produces_xor_parity() {
    let unit0 = spawn_node(0).await;
    let unit1 = spawn_node(1).await;
    let parity = spawn_node(3).await;
    let cco_id = CcoId::new(1, 1);

    let a = vec![0b0011_0011u8; 4];
    let b = vec![0b0101_0101u8; 4];

    commit_write(
        &parity,
        &[(&unit0, 0, a.clone()), (&unit1, 1, b.clone())],
        cco_id,
        0,
        4,
    )
    .await;

    let parity_block = parity.store.read_stripe_current(1, 0).await.unwrap().unwrap();
    let expected = netraid::parity::xor(&a, &b).unwrap();
    assert_eq!(parity_block.data, expected);
}

#[tokio::test]
async fn cross_stripe_write_persists_each_stripe_independently() {
    let data = spawn_node(0).await;
    let parity = spawn_node(3).await;

    commit_write(&parity, &[(&data, 0, vec![1; 4])], CcoId::new(1, 1), 0, 4).await;
    commit_write(&parity, &[(&data, 0, vec![2; 4])], CcoId::new(1, 2), 1, 4).await;

    let stripe0 = data.store.read_stripe_current(1, 0).await.unwrap().unwrap();
    let stripe1 = data.store.read_stripe_current(1, 1).await.unwrap().unwrap();
    assert_eq!(stripe0.data, vec![1; 4]);
    assert_eq!(stripe1.data, vec![2; 4]);
}

#[tokio::test]
async fn concurrent_writes_to_distinct_units_both_commit() {
    let unit0 = spawn_node(0).await;
    let unit1 = spawn_node(1).await;
    let parity = spawn_node(3).await;

    let cco_a = CcoId::new(1, 1);
    let cco_b = CcoId::new(2, 1);

    // Two independent stripes touched "concurrently" by different
    // clients; each runs its own three-phase commit against the same
    // coordinator node without interfering with the other's arena entry.
    let unit0_participants: [(&Node, u8, Vec<u8>); 1] = [(&unit0, 0, vec![7; 4])];
    let unit1_participants: [(&Node, u8, Vec<u8>); 1] = [(&unit1, 1, vec![9; 4])];
    let (a, b) = tokio::join!(
        commit_write(&parity, &unit0_participants, cco_a, 0, 4),
        commit_write(&parity, &unit1_participants, cco_b, 1, 4),
    );
    assert_eq!(a.len(), 4);
    assert_eq!(b.len(), 4);

    assert_eq!(
        unit0.store.read_stripe_current(1, 0).await.unwrap().unwrap().data,
        vec![7; 4]
    );
    assert_eq!(
        unit1.store.read_stripe_current(1, 1).await.unwrap().unwrap().data,
        vec![9; 4]
    );
}

#[tokio::test]
async fn stalled_coordinator_operation_is_failed_by_watchdog() {
    use netraid::op::participant::OPERATION_TIMEOUT_LEVEL_A;

    let parity = spawn_node(3).await;
    let cco_id = CcoId::new(1, 1);

    parity
        .on_coordinator_received(1, cco_id, &layout(), 0, 0, head(cco_id, 4, vec![0]))
        .await
        .unwrap();

    let mgr = parity.stripe_manager(1);
    mgr.with_coordinator(cco_id, |op| {
        op.received_at = std::time::Instant::now() - Duration::from_secs(60);
    })
    .unwrap();

    let timed_out = mgr.timeout_check(OPERATION_TIMEOUT_LEVEL_A);
    assert_eq!(timed_out, vec![cco_id]);

    let state = mgr
        .with_coordinator(cco_id, |op| op.state)
        .unwrap();
    assert_eq!(state, netraid::op::PrimaryCoordinatorState::Failure);
}

#[tokio::test]
async fn garbage_collection_prunes_superseded_versions() {
    let data = spawn_node(0).await;
    let cco_id = CcoId::new(1, 1);

    let parity = spawn_node(3).await;
    commit_write(&parity, &[(&data, 0, vec![1; 4])], cco_id, 0, 4).await;
    assert_eq!(data.store.max_version(1, 0).await.unwrap(), Some(1));

    let parity2 = spawn_node(3).await;
    commit_write(
        &parity2,
        &[(&data, 0, vec![2; 4])],
        CcoId::new(1, 2),
        0,
        4,
    )
    .await;
    assert_eq!(data.store.max_version(1, 0).await.unwrap(), Some(2));

    let pruned = data.cache.garbage_collection(&data.store).await.unwrap();
    assert_eq!(pruned, 1);

    let err = data.store.read_stripe_max_version(1, 0, 1).await.unwrap_err();
    assert!(matches!(err, netraid::Error::DiskIo { .. }));
    assert_eq!(
        data.store.read_stripe_current(1, 0).await.unwrap().unwrap().data,
        vec![2; 4]
    );
}
