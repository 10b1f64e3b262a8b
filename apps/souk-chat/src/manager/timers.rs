use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::warn;

/// Shortest period [`Timers::every`] will run at.
const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    ConnectTimeout,
    KeepAlive,
    Reconnect,
    Poll,
    TypingQuiet,
}

/// Timers owned by the session actor, at most one per purpose.
///
/// A firing timer only posts its payload back to the actor's queue. Arming a
/// purpose replaces whatever was armed for it before.
pub(crate) struct Timers<T> {
    tx: mpsc::UnboundedSender<T>,
    armed: HashMap<TimerKind, JoinHandle<()>>,
}

impl<T> Timers<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn new(tx: mpsc::UnboundedSender<T>) -> Self {
        Self {
            tx,
            armed: HashMap::new(),
        }
    }

    pub(crate) fn once(&mut self, kind: TimerKind, after: Duration, fire: T) {
        self.cancel(kind);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(fire);
        });
        self.armed.insert(kind, handle);
    }

    /// Fires every `period`, first after one full period.
    pub(crate) fn every(&mut self, kind: TimerKind, period: Duration, fire: T) {
        self.cancel(kind);
        // `interval_at` panics on a zero period.
        let period = if period < MIN_PERIOD {
            warn!(target = "chat.manager", ?kind, ?period, "timer period too short; clamped");
            MIN_PERIOD
        } else {
            period
        };
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(fire.clone()).is_err() {
                    break;
                }
            }
        });
        self.armed.insert(kind, handle);
    }
}

impl<T> Timers<T> {
    pub(crate) fn cancel(&mut self, kind: TimerKind) {
        if let Some(handle) = self.armed.remove(&kind) {
            handle.abort();
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        for (_, handle) in self.armed.drain() {
            handle.abort();
        }
    }

    pub(crate) fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed
            .get(&kind)
            .is_some_and(|handle| !handle.is_finished())
    }

    pub(crate) fn armed_count(&self) -> usize {
        self.armed
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }
}

impl<T> Drop for Timers<T> {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_timeout::tokio_paused_test;

    #[tokio_paused_test]
    async fn once_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.once(TimerKind::Reconnect, Duration::from_secs(3), 7u32);
        assert!(timers.is_armed(TimerKind::Reconnect));

        tokio::time::sleep(Duration::from_millis(2999)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(rx.recv().await, Some(7));
    }

    #[tokio_paused_test]
    async fn rearming_replaces_previous_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.once(TimerKind::TypingQuiet, Duration::from_secs(3), 1u64);
        tokio::time::sleep(Duration::from_secs(2)).await;
        timers.once(TimerKind::TypingQuiet, Duration::from_secs(3), 2u64);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rx.try_recv().ok(), Some(2));
        assert!(rx.try_recv().is_err());
    }

    #[tokio_paused_test]
    async fn every_ticks_until_cancelled() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.every(TimerKind::Poll, Duration::from_secs(2), ());

        tokio::time::sleep(Duration::from_millis(6500)).await;
        let mut ticks = 0;
        while rx.try_recv().is_ok() {
            ticks += 1;
        }
        assert_eq!(ticks, 3);

        timers.cancel(TimerKind::Poll);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio_paused_test]
    async fn zero_period_still_ticks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.every(TimerKind::Poll, Duration::ZERO, ());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(timers.is_armed(TimerKind::Poll));
        assert_eq!(rx.recv().await, Some(()));
    }

    #[tokio_paused_test(300)]
    async fn cancel_all_silences_everything() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.once(TimerKind::ConnectTimeout, Duration::from_secs(2), 'c');
        timers.every(TimerKind::KeepAlive, Duration::from_secs(30), 'k');
        assert_eq!(timers.armed_count(), 2);

        timers.cancel_all();
        assert_eq!(timers.armed_count(), 0);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }
}
