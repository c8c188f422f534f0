use crate::actor::WeakActorClient;
use crate::server::messages::HeartbeatTimerTick;
use crate::server::timers::clock::{Clock, SystemClock};
use crate::server::timers::sync::SharedDeadline;
use std::sync::{Arc, Weak};
use tokio::time::{Duration, Instant};

/// HeartbeatTimerHandle drives one peer's replication cadence while we are
/// leader. Any AppendEntries sent to the peer (batched client traffic) resets
/// the timer; if nothing was sent for a full interval, the task ticks the
/// actor, which sends an empty heartbeat. One handle exists per peer per term;
/// dropping it (lost leadership, reconfiguration) stops the task.
pub(crate) struct HeartbeatTimerHandle<C: Clock = SystemClock> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Clock> {
    interval: Duration,
    next_send_time: SharedDeadline<Instant>,
    clock: C,
}

struct HeartbeatTimerTask<C: Clock> {
    weak_shared: Weak<Shared<C>>,
    next_send_time: SharedDeadline<Instant>,
    actor_client: WeakActorClient,
    tick: HeartbeatTimerTick,
    clock: C,
}

impl HeartbeatTimerHandle {
    pub(crate) fn spawn(interval: Duration, actor_client: WeakActorClient, tick: HeartbeatTimerTick) -> Self {
        let (task, handle) = HeartbeatTimerTask::new(interval, actor_client, tick, SystemClock);
        tokio::task::spawn(task.run());
        handle
    }
}

impl<C: Clock + Send + Sync + 'static> HeartbeatTimerHandle<C> {
    /// Push the next periodic send out one interval; called whenever traffic
    /// was just sent to the peer.
    pub(crate) fn defer(&self) {
        self.shared.defer();
    }
}

impl<C: Clock> Shared<C> {
    fn defer(&self) {
        self.next_send_time.set(self.clock.now() + self.interval);
    }
}

impl<C: Clock + Send + Sync + 'static> HeartbeatTimerTask<C> {
    fn new(
        interval: Duration,
        actor_client: WeakActorClient,
        tick: HeartbeatTimerTick,
        clock: C,
    ) -> (Self, HeartbeatTimerHandle<C>) {
        let next_send_time = SharedDeadline::empty();
        let shared = Arc::new(Shared {
            interval,
            next_send_time: next_send_time.clone(),
            clock: clock.clone(),
        });

        let task = HeartbeatTimerTask {
            weak_shared: Arc::downgrade(&shared),
            next_send_time,
            actor_client,
            tick,
            clock,
        };
        let handle = HeartbeatTimerHandle { shared };

        (task, handle)
    }

    async fn run(mut self) {
        // The deadline cell starts empty, so the first loop iteration ticks
        // immediately: a fresh leader wants its authority known right away.
        loop {
            match self.next_send_time.take() {
                Some(deadline) => {
                    self.clock.sleep_until(deadline).await;
                }
                None => {
                    match self.weak_shared.upgrade() {
                        Some(shared) => {
                            self.actor_client.heartbeat_timer_tick(self.tick.clone()).await;
                            shared.defer();
                        }
                        // Handle dropped: no longer leader for this term.
                        None => return,
                    }
                }
            }
        }
    }
}
