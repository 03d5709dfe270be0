//! Priority-queue message dispatch and the worker pool that drains it.
//!
//! Five bounded queues carry incoming and outgoing work: `realtime`
//! (coordinator outbound follow-ups), `primary_receive`
//! (participant-originated coordinator work), `secondary_receive`
//! (participant receive-side work), `client_primary` (client-initiated
//! outbound), and `maintenance` (garbage-collector ticks). A drain loop
//! polls the queues in priority order; `tokio::sync::mpsc`'s bounded
//! channels give us blocking-pop-with-backpressure for free, so there is
//! no hand-rolled exponential backoff sleep here — `select!`'s biased
//! polling realizes the same priority-order draining the original's
//! `usleep`-based backoff loop approximated with busy polling.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, instrument};

/// One unit of dispatchable work: an inbound message already decoded,
/// tagged with which queue it was classified into.
#[derive(Debug)]
pub struct Job {
    pub queue: QueueKind,
    pub payload: crate::message::Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Realtime,
    PrimaryReceive,
    SecondaryReceive,
    ClientPrimary,
    Maintenance,
}

/// Bounded per-priority channels plus the sending half handed out to
/// whatever classifies incoming messages.
pub struct Dispatcher {
    realtime_tx: mpsc::Sender<Job>,
    primary_receive_tx: mpsc::Sender<Job>,
    secondary_receive_tx: mpsc::Sender<Job>,
    client_primary_tx: mpsc::Sender<Job>,
    maintenance_tx: mpsc::Sender<Job>,
}

/// Receiving halves, consumed once by the worker pool's drain loop.
pub struct DispatchQueues {
    realtime_rx: mpsc::Receiver<Job>,
    primary_receive_rx: mpsc::Receiver<Job>,
    secondary_receive_rx: mpsc::Receiver<Job>,
    client_primary_rx: mpsc::Receiver<Job>,
    maintenance_rx: mpsc::Receiver<Job>,
}

/// Per-queue channel capacity. A full queue applies backpressure to
/// whoever is submitting jobs rather than growing unbounded.
const QUEUE_CAPACITY: usize = 1024;

pub fn channel() -> (Dispatcher, DispatchQueues) {
    let (realtime_tx, realtime_rx) = mpsc::channel(QUEUE_CAPACITY);
    let (primary_receive_tx, primary_receive_rx) = mpsc::channel(QUEUE_CAPACITY);
    let (secondary_receive_tx, secondary_receive_rx) = mpsc::channel(QUEUE_CAPACITY);
    let (client_primary_tx, client_primary_rx) = mpsc::channel(QUEUE_CAPACITY);
    let (maintenance_tx, maintenance_rx) = mpsc::channel(QUEUE_CAPACITY);

    (
        Dispatcher {
            realtime_tx,
            primary_receive_tx,
            secondary_receive_tx,
            client_primary_tx,
            maintenance_tx,
        },
        DispatchQueues {
            realtime_rx,
            primary_receive_rx,
            secondary_receive_rx,
            client_primary_rx,
            maintenance_rx,
        },
    )
}

impl Dispatcher {
    #[instrument(skip(self, payload), fields(?queue))]
    pub async fn submit(&self, queue: QueueKind, payload: crate::message::Message) -> bool {
        let job = Job { queue, payload };
        let tx = match queue {
            QueueKind::Realtime => &self.realtime_tx,
            QueueKind::PrimaryReceive => &self.primary_receive_tx,
            QueueKind::SecondaryReceive => &self.secondary_receive_tx,
            QueueKind::ClientPrimary => &self.client_primary_tx,
            QueueKind::Maintenance => &self.maintenance_tx,
        };
        tx.send(job).await.is_ok()
    }
}

impl Clone for Dispatcher {
    fn clone(&self) -> Self {
        Self {
            realtime_tx: self.realtime_tx.clone(),
            primary_receive_tx: self.primary_receive_tx.clone(),
            secondary_receive_tx: self.secondary_receive_tx.clone(),
            client_primary_tx: self.client_primary_tx.clone(),
            maintenance_tx: self.maintenance_tx.clone(),
        }
    }
}

/// Drains `queues` in strict priority order — `realtime` first, then
/// `primary_receive`, `secondary_receive`, `client_primary`, and
/// finally `maintenance` — handing each job to `handler`. Runs until
/// every sender has been dropped.
pub async fn run_worker<F, Fut>(mut queues: DispatchQueues, handler: Arc<F>)
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    loop {
        let job = tokio::select! {
            biased;
            Some(job) = queues.realtime_rx.recv() => job,
            Some(job) = queues.primary_receive_rx.recv() => job,
            Some(job) = queues.secondary_receive_rx.recv() => job,
            Some(job) = queues.client_primary_rx.recv() => job,
            Some(job) = queues.maintenance_rx.recv() => job,
            else => {
                debug!("all dispatch queues closed, worker exiting");
                return;
            }
        };
        handler(job).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::FileLayout;
    use crate::message::{CcoId, MessageHeader, MessageType, OpHead, OpStatus, OpType, ProtocolId};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_message() -> crate::message::Message {
        crate::message::Message::new(
            MessageHeader {
                protocol_id: ProtocolId::Ccc,
                message_type: MessageType::Received,
                sequence_number: 0,
                created_at_unix_ms: 0,
                op_head: OpHead {
                    cco_id: CcoId::new(1, 1),
                    inum: 1,
                    offset: 0,
                    length: 0,
                    op_type: OpType::Participant,
                    subtype: 0,
                    stripe_count: 1,
                    status: OpStatus::Init,
                    file_layout: FileLayout::new(4, 4096, vec![0, 1, 2, 3]).unwrap(),
                    participant_units: vec![0],
                    unit: 0,
                    version: 0,
                },
                stripe_id: 0,
            },
            Bytes::new(),
        )
    }

    #[tokio::test]
    async fn realtime_jobs_drain_before_maintenance_jobs() {
        let (dispatcher, queues) = channel();
        dispatcher
            .submit(QueueKind::Maintenance, sample_message())
            .await;
        dispatcher
            .submit(QueueKind::Realtime, sample_message())
            .await;

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();

        let handler = Arc::new(move |job: Job| {
            let seen = seen_clone.clone();
            let count = count_clone.clone();
            async move {
                seen.lock().unwrap().push(job.queue);
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        let worker = tokio::spawn(run_worker(queues, handler));
        // Give the worker a moment to drain both queued jobs, then drop the
        // dispatcher to close channels and let the worker exit.
        while count.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        drop(dispatcher);
        worker.await.unwrap();

        let order = seen.lock().unwrap().clone();
        assert_eq!(order, vec![QueueKind::Realtime, QueueKind::Maintenance]);
    }
}
