use crate::actor::WeakActorClient;
use crate::server::timers::clock::{Clock, SystemClock};
use crate::server::timers::sync::{cancel_pair, CancelFlag, CancelGuard};
use tokio::time::Duration;

/// Which periodic chore an interval timer drives.
#[derive(Copy, Clone, Debug)]
pub(crate) enum IntervalKind {
    /// Leader-only sweep that expires Suspect sessions.
    SessionCheck,
    /// Stateful member announcing liveness + commit index to the leader.
    MemberHeartbeat,
    /// Log compaction pass.
    Compaction,
}

/// A plain fixed-interval ticker. Unlike the election and heartbeat timers it
/// has no reset path; it exists to be cancelled on role change by dropping the
/// handle.
pub(crate) struct IntervalTimerHandle {
    _cancel_on_drop: CancelGuard,
}

struct IntervalTimerTask<C: Clock> {
    interval: Duration,
    kind: IntervalKind,
    actor_client: WeakActorClient,
    clock: C,
    cancel: CancelFlag,
}

impl IntervalTimerHandle {
    pub(crate) fn spawn(interval: Duration, kind: IntervalKind, actor_client: WeakActorClient) -> Self {
        let (guard, cancel) = cancel_pair();
        let task = IntervalTimerTask {
            interval,
            kind,
            actor_client,
            clock: SystemClock,
            cancel,
        };
        tokio::task::spawn(task.run());
        IntervalTimerHandle { _cancel_on_drop: guard }
    }
}

impl<C: Clock + Send + Sync + 'static> IntervalTimerTask<C> {
    async fn run(mut self) {
        loop {
            self.clock.sleep(self.interval).await;
            if self.cancel.is_cancelled() {
                return;
            }
            match self.kind {
                IntervalKind::SessionCheck => self.actor_client.session_check_tick().await,
                IntervalKind::MemberHeartbeat => self.actor_client.member_heartbeat_tick().await,
                IntervalKind::Compaction => self.actor_client.compaction_tick().await,
            }
            if self.cancel.is_cancelled() {
                return;
            }
        }
    }
}
