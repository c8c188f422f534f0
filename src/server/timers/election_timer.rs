use crate::actor::WeakActorClient;
use crate::server::timers::clock::{Clock, SystemClock};
use crate::server::timers::sync::{cancel_pair, CancelFlag, CancelGuard, SharedDeadline};
use rand::Rng;
use std::ops::RangeInclusive;
use tokio::time::{Duration, Instant};

/// ElectionTimerHandle arms the randomized election timeout for a follower or
/// candidate. Each AppendEntries from a valid leader resets it; if it ever
/// fires, the actor receives an ElectionTimeout event. Dropping the handle
/// (role transition) cancels the timer task.
pub(crate) struct ElectionTimerHandle<C: Clock = SystemClock> {
    deadline: SharedDeadline<Instant>,
    timeout_range: RangeInclusive<Duration>,
    clock: C,
    _cancel_on_drop: CancelGuard,
}

struct ElectionTimerTask<C: Clock> {
    deadline: SharedDeadline<Instant>,
    actor_client: WeakActorClient,
    clock: C,
    cancel: CancelFlag,
    // Pause between consecutive timeout firings so a stuck election doesn't
    // spin the actor queue.
    refire_backoff: Duration,
}

impl ElectionTimerHandle {
    pub(crate) fn spawn(min_timeout: Duration, max_timeout: Duration, actor_client: WeakActorClient) -> Self {
        let (task, handle) = ElectionTimerTask::new(min_timeout, max_timeout, actor_client, SystemClock);
        tokio::task::spawn(task.run());
        handle
    }
}

impl<C: Clock + Send + Sync + 'static> ElectionTimerHandle<C> {
    pub(crate) fn reset(&self) {
        self.deadline.set(self.random_deadline());
    }

    fn random_deadline(&self) -> Instant {
        let jittered = rand::thread_rng().gen_range(self.timeout_range.clone());
        self.clock.now() + jittered
    }
}

impl<C: Clock + Send + Sync + 'static> ElectionTimerTask<C> {
    fn new(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: WeakActorClient,
        clock: C,
    ) -> (Self, ElectionTimerHandle<C>) {
        let deadline = SharedDeadline::empty();
        let (guard, cancel) = cancel_pair();

        let task = ElectionTimerTask {
            deadline: deadline.clone(),
            actor_client,
            clock: clock.clone(),
            cancel,
            refire_backoff: min_timeout,
        };
        let handle = ElectionTimerHandle {
            deadline,
            timeout_range: RangeInclusive::new(min_timeout, max_timeout),
            clock,
            _cancel_on_drop: guard,
        };

        // Arm the first deadline before the task runs, or it would fire
        // immediately on an empty cell.
        handle.reset();

        (task, handle)
    }

    async fn run(mut self) {
        loop {
            match self.deadline.take() {
                Some(deadline) => {
                    // The deadline was pushed out (leader contact); sleep to it.
                    self.clock.sleep_until(deadline).await;
                }
                None => {
                    // Slept to the last known deadline with no reset in
                    // between: that's an election timeout. The cancel check
                    // runs first in case the role changed while we slept.
                    if self.cancel.is_cancelled() {
                        return;
                    }
                    self.actor_client.election_timeout().await;
                    self.clock.sleep(self.refire_backoff).await;
                }
            }

            if self.cancel.is_cancelled() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::server::timers::clock::manual_clock;
    use crate::server::timers::test_support::EventProbe;

    #[tokio::test]
    async fn fires_only_after_quiet_timeout() {
        let timeout = Duration::from_millis(100);
        let (strong_client, rx) = ActorClient::new(10);
        let mut probe = EventProbe::new(rx);
        let (clock, mut clock_handle) = manual_clock();

        // min == max so the test isn't at the mercy of jitter.
        let (task, handle) = ElectionTimerTask::new(timeout, timeout, strong_client.weak(), clock);
        tokio::task::spawn(task.run());
        probe.assert_no_event().await;

        // Keep resetting before the deadline: no timeout.
        for _ in 0..5 {
            clock_handle.advance(timeout / 2);
            handle.reset();
        }
        probe.assert_no_event().await;

        // Let a full timeout elapse with no reset.
        clock_handle.advance(timeout);
        probe.assert_election_timeout().await;
    }

    #[tokio::test]
    async fn dropping_handle_cancels_task() {
        let timeout = Duration::from_millis(100);
        let (strong_client, rx) = ActorClient::new(10);
        let mut probe = EventProbe::new(rx);
        let (clock, mut clock_handle) = manual_clock();

        let (task, handle) = ElectionTimerTask::new(timeout, timeout, strong_client.weak(), clock);
        let task_handle = tokio::task::spawn(task.run());

        drop(handle);
        clock_handle.advance(timeout * 2);
        task_handle.await.unwrap();
        probe.assert_no_event().await;
    }

    #[tokio::test]
    async fn reset_after_timeout_keeps_timer_alive() {
        let timeout = Duration::from_millis(100);
        let (strong_client, rx) = ActorClient::new(10);
        let mut probe = EventProbe::new(rx);
        let (clock, mut clock_handle) = manual_clock();

        let (task, handle) = ElectionTimerTask::new(timeout, timeout, strong_client.weak(), clock);
        tokio::task::spawn(task.run());

        clock_handle.advance(timeout);
        probe.assert_election_timeout().await;

        // The actor stayed follower (e.g. lost the poll) and reset the timer;
        // the task must still be serving resets.
        handle.reset();
        for _ in 0..5 {
            clock_handle.advance(timeout / 2);
            handle.reset();
        }
        probe.assert_no_event().await;
    }
}
