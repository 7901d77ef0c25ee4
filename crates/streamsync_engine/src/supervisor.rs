//! Reconnect supervision for the control channel.
//!
//! After an unexpected close the supervisor schedules exactly one reconnect
//! after a fixed delay. An explicit disconnect disarms it and disposal makes
//! it permanently inert. Each scheduled attempt carries a generation number
//! so a timer that fires after being superseded is recognised and dropped.

use crate::engine::Signal;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
pub(crate) struct ReconnectSupervisor {
    delay: Duration,
    armed: bool,
    disposed: bool,
    generation: u64,
    pending: Option<CancellationToken>,
    attempts: u64,
}

impl ReconnectSupervisor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            armed: false,
            disposed: false,
            generation: 0,
            pending: None,
            attempts: 0,
        }
    }

    /// Enables reconnects. No effect after disposal.
    pub fn arm(&mut self) {
        if !self.disposed {
            self.armed = true;
        }
    }

    /// Disables reconnects and cancels any pending timer.
    pub fn disarm(&mut self) {
        self.armed = false;
        self.cancel_pending();
    }

    pub fn dispose(&mut self) {
        self.disposed = true;
        self.disarm();
    }

    pub fn is_armed(&self) -> bool {
        self.armed && !self.disposed
    }

    /// Consecutive reconnects scheduled since the last successful open.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn on_connected(&mut self) {
        self.attempts = 0;
    }

    /// Schedules a reconnect after an unexpected close.
    ///
    /// Returns the delay, or `None` if disarmed or one is already pending.
    pub fn on_failure(&mut self, signals: &mpsc::UnboundedSender<Signal>) -> Option<Duration> {
        if !self.is_armed() || self.pending.is_some() {
            return None;
        }
        self.generation += 1;
        self.attempts += 1;
        let generation = self.generation;
        let cancel = CancellationToken::new();
        self.pending = Some(cancel.clone());

        let delay = self.delay;
        let signals = signals.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(generation, "reconnect timer cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    let _ = signals.send(Signal::ReconnectDue { generation });
                }
            }
        });
        Some(delay)
    }

    /// Claims a fired timer. Returns true if the reconnect should proceed.
    pub fn take_due(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.pending.is_none() {
            return false;
        }
        self.pending = None;
        self.is_armed()
    }

    fn cancel_pending(&mut self) {
        if let Some(cancel) = self.pending.take() {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn due_generation(signal: Signal) -> u64 {
        match signal {
            Signal::ReconnectDue { generation } => generation,
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn schedules_once_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut supervisor = ReconnectSupervisor::new(Duration::from_secs(2));
        supervisor.arm();

        assert_eq!(supervisor.on_failure(&tx), Some(Duration::from_secs(2)));
        assert_eq!(supervisor.on_failure(&tx), None);

        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_millis(2)).await;

        let generation = due_generation(rx.recv().await.unwrap());
        assert!(supervisor.take_due(generation));
        assert!(!supervisor.take_due(generation));
        assert_eq!(supervisor.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unarmed_supervisor_never_schedules() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut supervisor = ReconnectSupervisor::new(Duration::from_secs(2));
        assert_eq!(supervisor.on_failure(&tx), None);
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_cancels_pending_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut supervisor = ReconnectSupervisor::new(Duration::from_secs(2));
        supervisor.arm();
        supervisor.on_failure(&tx);
        supervisor.disarm();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn disposed_supervisor_cannot_be_rearmed() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut supervisor = ReconnectSupervisor::new(Duration::from_secs(2));
        supervisor.arm();
        supervisor.dispose();
        supervisor.arm();
        assert!(!supervisor.is_armed());
        assert_eq!(supervisor.on_failure(&tx), None);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_generation_is_ignored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut supervisor = ReconnectSupervisor::new(Duration::from_secs(1));
        supervisor.arm();
        supervisor.on_failure(&tx);
        tokio::time::sleep(Duration::from_millis(1001)).await;
        let first = due_generation(rx.recv().await.unwrap());

        supervisor.disarm();
        supervisor.arm();
        supervisor.on_failure(&tx);
        assert!(!supervisor.take_due(first));

        tokio::time::sleep(Duration::from_millis(1001)).await;
        let second = due_generation(rx.recv().await.unwrap());
        assert!(supervisor.take_due(second));

        supervisor.on_connected();
        assert_eq!(supervisor.attempts(), 0);
    }
}
