use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::model::Mission;
use crate::state::Transition;

/// Stream of status changes for one mission. Ends after the terminal one.
pub type TransitionStream = Pin<Box<dyn Stream<Item = Transition> + Send>>;

/// Monotonic time for one mission, anchored to wall-clock time at
/// submission. Every timestamp the mission records comes from here.
#[derive(Debug, Clone, Copy)]
pub struct MissionClock {
    origin_utc: DateTime<Utc>,
    origin: Instant,
    deadline: Instant,
}

impl MissionClock {
    pub fn start(timeout: Duration) -> Self {
        let origin = Instant::now();
        Self {
            origin_utc: Utc::now(),
            origin,
            deadline: origin + timeout,
        }
    }

    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn stamp(&self, at: Instant) -> DateTime<Utc> {
        let offset = chrono::Duration::from_std(at.saturating_duration_since(self.origin))
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.origin_utc
            .checked_add_signed(offset)
            .unwrap_or(self.origin_utc)
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.origin_utc
    }

    pub fn deadline_utc(&self) -> DateTime<Utc> {
        self.stamp(self.deadline)
    }

    pub fn is_past(&self, now: Instant) -> bool {
        now > self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// `now` clamped to the deadline.
    pub fn stamp_now(&self) -> DateTime<Utc> {
        self.stamp(Instant::now().min(self.deadline))
    }
}

/// Live state of one admitted mission.
pub struct MissionEntry {
    pub(super) mission: tokio::sync::Mutex<Mission>,
    pub(super) clock: MissionClock,
    pub(super) cancel: CancellationToken,
    updates: Mutex<Option<broadcast::Sender<Transition>>>,
}

impl MissionEntry {
    pub fn new(mission: Mission, clock: MissionClock, cancel: CancellationToken, buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self {
            mission: tokio::sync::Mutex::new(mission),
            clock,
            cancel,
            updates: Mutex::new(Some(tx)),
        }
    }

    pub async fn snapshot(&self) -> Mission {
        self.mission.lock().await.clone()
    }

    /// Fan a transition out to subscribers without waiting on any of them.
    /// The channel closes after a terminal transition.
    pub fn notify(&self, transition: Transition) {
        let mut updates = self.updates.lock().unwrap_or_else(PoisonError::into_inner);
        let terminal = transition.to.is_terminal();
        if let Some(tx) = updates.as_ref() {
            // No receivers is fine.
            let _ = tx.send(transition);
        }
        if terminal {
            updates.take();
        }
    }

    pub fn subscribe(&self) -> TransitionStream {
        let updates = self.updates.lock().unwrap_or_else(PoisonError::into_inner);
        match updates.as_ref() {
            Some(tx) => {
                let stream = BroadcastStream::new(tx.subscribe()).filter_map(|item| match item {
                    Ok(transition) => Some(transition),
                    Err(lagged) => {
                        tracing::debug!(error = %lagged, "subscriber lagged");
                        None
                    }
                });
                Box::pin(stream)
            }
            None => Box::pin(tokio_stream::empty::<Transition>()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MissionId, SubmitOptions};
    use crate::state::MissionStatus;

    fn entry() -> MissionEntry {
        let clock = MissionClock::start(Duration::from_secs(60));
        let mission = Mission::new(
            "x",
            3,
            clock.submitted_at(),
            clock.deadline_utc(),
            SubmitOptions::default(),
        );
        MissionEntry::new(mission, clock, CancellationToken::new(), 4)
    }

    fn transition(to: MissionStatus, seq: u64) -> Transition {
        Transition {
            mission_id: MissionId::new(),
            seq,
            from: MissionStatus::Pending,
            to,
            at: Utc::now(),
            attempt: 0,
            detail: String::new(),
            failure: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stamps_follow_the_monotonic_clock() {
        let clock = MissionClock::start(Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(4)).await;
        let at = clock.stamp(Instant::now());
        assert_eq!((at - clock.submitted_at()).num_seconds(), 4);
        assert_eq!((clock.deadline_utc() - clock.submitted_at()).num_seconds(), 10);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(clock.is_past(Instant::now()));
        assert_eq!(clock.stamp_now(), clock.deadline_utc());
        assert_eq!(clock.remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn stream_ends_after_terminal_transition() {
        let entry = entry();
        let mut stream = entry.subscribe();
        entry.notify(transition(MissionStatus::Architecting, 2));
        entry.notify(transition(MissionStatus::Failed, 3));

        assert_eq!(stream.next().await.map(|t| t.to), Some(MissionStatus::Architecting));
        assert_eq!(stream.next().await.map(|t| t.to), Some(MissionStatus::Failed));
        assert!(stream.next().await.is_none());

        let mut late = entry.subscribe();
        assert!(late.next().await.is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_block_notify() {
        let entry = entry();
        let stream = entry.subscribe();
        for seq in 0..20 {
            entry.notify(transition(MissionStatus::Validating, seq));
        }
        entry.notify(transition(MissionStatus::Succeeded, 21));
        let seen: Vec<u64> = stream.map(|t| t.seq).collect().await;
        assert!(seen.len() <= 4);
        assert_eq!(seen.last(), Some(&21));
    }
}
