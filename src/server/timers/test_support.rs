use crate::actor::Event;
use crate::server::messages::HeartbeatTimerTick;
use tokio::sync::mpsc;
use tokio::time::Duration;

/// EventProbe drains the actor queue in timer tests, asserting which events
/// the timer tasks posted.
pub(crate) struct EventProbe {
    receiver: mpsc::Receiver<Event>,
}

impl EventProbe {
    pub(crate) fn new(receiver: mpsc::Receiver<Event>) -> Self {
        EventProbe { receiver }
    }

    pub(crate) async fn assert_election_timeout(&mut self) {
        let event = tokio::time::timeout(Duration::from_secs(1), self.receiver.recv())
            .await
            .expect("expected an event within 1s")
            .expect("actor queue closed");
        assert!(
            matches!(event, Event::ElectionTimeout),
            "expected ElectionTimeout, got {:?}",
            event
        );
    }

    pub(crate) async fn assert_heartbeat_tick(&mut self, expected: HeartbeatTimerTick) {
        let event = tokio::time::timeout(Duration::from_secs(1), self.receiver.recv())
            .await
            .expect("expected an event within 1s")
            .expect("actor queue closed");
        match event {
            Event::HeartbeatTimerTick(tick) => assert_eq!(tick, expected),
            other => panic!("expected HeartbeatTimerTick, got {:?}", other),
        }
    }

    /// Asserts the queue stays empty for a short grace period. Uses a real
    /// sleep: the manual clock in these tests never advances on its own, so
    /// any stray event must already be in flight.
    pub(crate) async fn assert_no_event(&mut self) {
        tokio::task::yield_now().await;
        match tokio::time::timeout(Duration::from_millis(50), self.receiver.recv()).await {
            Err(_elapsed) => {}
            Ok(Some(event)) => panic!("expected no event, got {:?}", event),
            Ok(None) => panic!("actor queue closed"),
        }
    }
}
