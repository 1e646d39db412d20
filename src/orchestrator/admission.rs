//! Admission gate.
//!
//! One dispatcher task hands out semaphore permits to waiting missions in
//! the order they were submitted. A mission holds its permit from admission
//! until it reaches a terminal state.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::model::MissionId;

/// A place in the admission queue.
pub struct Ticket {
    pub id: MissionId,
    pub grant: oneshot::Sender<OwnedSemaphorePermit>,
}

pub fn spawn_dispatcher(
    tracker: &TaskTracker,
    slots: Arc<Semaphore>,
    mut queue: mpsc::UnboundedReceiver<Ticket>,
    shutdown: CancellationToken,
) {
    tracker.spawn(async move {
        loop {
            let mut permit = tokio::select! {
                biased;
                () = shutdown.cancelled() => return,
                acquired = Arc::clone(&slots).acquire_owned() => match acquired {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            // Hand the slot to the oldest ticket whose mission is still waiting.
            loop {
                let ticket = tokio::select! {
                    biased;
                    () = shutdown.cancelled() => return,
                    next = queue.recv() => match next {
                        Some(ticket) => ticket,
                        None => return,
                    },
                };
                match ticket.grant.send(permit) {
                    Ok(()) => {
                        debug!(mission = %ticket.id, "admitted");
                        break;
                    }
                    Err(returned) => {
                        debug!(mission = %ticket.id, "ticket abandoned before admission");
                        permit = returned;
                    }
                }
            }
        }
    });
}

/// Counts missions currently in EXECUTING and remembers the high-water mark.
#[derive(Debug, Default)]
pub struct ExecutionGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ExecutionGauge {
    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn ticket() -> (Ticket, oneshot::Receiver<OwnedSemaphorePermit>) {
        let (grant, granted) = oneshot::channel();
        (
            Ticket {
                id: MissionId::new(),
                grant,
            },
            granted,
        )
    }

    #[tokio::test]
    async fn grants_in_submission_order() {
        let tracker = TaskTracker::new();
        let slots = Arc::new(Semaphore::new(1));
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        spawn_dispatcher(&tracker, Arc::clone(&slots), rx, shutdown.clone());

        let (a, a_rx) = ticket();
        let (b, mut b_rx) = ticket();
        tx.send(a).unwrap();
        tx.send(b).unwrap();

        let first = a_rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(b_rx.try_recv().is_err(), "second mission admitted while the slot was held");

        drop(first);
        assert!(b_rx.await.is_ok());

        shutdown.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn abandoned_ticket_passes_its_slot_on() {
        let tracker = TaskTracker::new();
        let slots = Arc::new(Semaphore::new(1));
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        spawn_dispatcher(&tracker, Arc::clone(&slots), rx, shutdown.clone());

        let (gone, gone_rx) = ticket();
        drop(gone_rx);
        let (live, live_rx) = ticket();
        tx.send(gone).unwrap();
        tx.send(live).unwrap();
        assert!(live_rx.await.is_ok());

        shutdown.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[test]
    fn gauge_tracks_peak() {
        let gauge = ExecutionGauge::default();
        gauge.enter();
        gauge.enter();
        gauge.leave();
        gauge.enter();
        assert_eq!(gauge.current(), 2);
        assert_eq!(gauge.peak(), 2);
        gauge.leave();
        gauge.leave();
        assert_eq!(gauge.current(), 0);
    }
}
