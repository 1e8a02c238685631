//! One-shot and periodic timers that post into a single actor's mailbox.
//!
//! Timers are relative to the tokio monotonic clock. Arming replaces any
//! previous schedule; disarming aborts it, so a state that disarms on exit
//! can never receive a stale timeout in a later state.

use std::time::Duration;

use tokio::task::JoinHandle;

use super::Mailbox;

pub struct Timer<E: Clone + Send + 'static> {
    mailbox: Mailbox<E>,
    handle: Option<JoinHandle<()>>,
}

impl<E: Clone + Send + 'static> Timer<E> {
    pub fn new(mailbox: Mailbox<E>) -> Self {
        Self {
            mailbox,
            handle: None,
        }
    }

    /// Deliver `event` once after `after`. Replaces any pending schedule.
    pub fn arm(&mut self, after: Duration, event: E) {
        self.disarm();
        let mailbox = self.mailbox.clone();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            mailbox.post(event);
        }));
    }

    /// Deliver `event` every `every`, first delivery one period from now.
    /// Replaces any pending schedule.
    pub fn arm_periodic(&mut self, every: Duration, event: E) {
        self.disarm();
        let mailbox = self.mailbox.clone();
        self.handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(
                tokio::time::Instant::now() + every,
                every,
            );
            loop {
                interval.tick().await;
                mailbox.post(event.clone());
            }
        }));
    }

    /// Cancel the pending schedule, if any.
    pub fn disarm(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl<E: Clone + Send + 'static> Drop for Timer<E> {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mailbox;

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_fires_once() {
        let (tx, mut rx) = mailbox::<u32>();
        let mut timer = Timer::new(tx);
        timer.arm(Duration::from_secs(5), 7);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(rx.recv().await, Some(7));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err(), "one-shot must not refire");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_prevents_delivery() {
        let (tx, mut rx) = mailbox::<u32>();
        let mut timer = Timer::new(tx);
        timer.arm(Duration::from_secs(5), 7);
        timer.disarm();

        tokio::time::advance(Duration::from_secs(10)).await;
        // Yield so an (incorrectly) surviving task would get to run.
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_fires_repeatedly() {
        let (tx, mut rx) = mailbox::<u32>();
        let mut timer = Timer::new(tx);
        timer.arm_periodic(Duration::from_secs(10), 1);

        tokio::time::advance(Duration::from_secs(35)).await;
        tokio::task::yield_now().await;

        let mut fired = 0;
        while rx.try_recv().is_ok() {
            fired += 1;
        }
        assert_eq!(fired, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous_schedule() {
        let (tx, mut rx) = mailbox::<u32>();
        let mut timer = Timer::new(tx);
        timer.arm(Duration::from_secs(5), 1);
        timer.arm(Duration::from_secs(5), 2);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(rx.recv().await, Some(2));
        assert!(rx.try_recv().is_err());
    }
}
