use tokio::sync::watch;
use tokio::time::{Duration, Instant};

/// Clock abstracts "what time is it" and "sleep until" for timer tasks, so
/// tests can drive timers deterministically instead of sleeping for real.
/// This is wall-clock time for scheduling only; nothing on the apply path
/// reads it.
#[async_trait::async_trait]
pub(crate) trait Clock: Clone {
    fn now(&self) -> Instant;
    async fn sleep_until(&mut self, deadline: Instant);

    async fn sleep(&mut self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }
}

#[derive(Copy, Clone)]
pub(crate) struct SystemClock;

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

/// A manually advanced clock for tests. The returned handle moves time; every
/// clone of the clock observes the same timeline through a watch channel.
#[allow(dead_code)]
pub(crate) fn manual_clock() -> (ManualClock, ManualClockHandle) {
    let epoch = Instant::now();
    let (tx, rx) = watch::channel(epoch);
    (
        ManualClock { current: rx },
        ManualClockHandle { current: tx, epoch },
    )
}

#[allow(dead_code)]
#[derive(Clone)]
pub(crate) struct ManualClock {
    current: watch::Receiver<Instant>,
}

#[async_trait::async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.current.borrow()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        while *self.current.borrow() < deadline {
            self.current.changed().await.expect("manual clock handle dropped");
        }
    }
}

#[allow(dead_code)]
pub(crate) struct ManualClockHandle {
    current: watch::Sender<Instant>,
    epoch: Instant,
}

#[allow(dead_code)]
impl ManualClockHandle {
    pub(crate) fn elapsed(&self) -> Duration {
        *self.current.borrow() - self.epoch
    }

    /// Advance in increments no larger than the granularity you want to
    /// observe: a sleeper woken by a big jump sees time well past its
    /// deadline, same as a real clock that stalled.
    pub(crate) fn advance(&mut self, duration: Duration) {
        let now = *self.current.borrow();
        self.current.send(now + duration).expect("all manual clocks dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn manual_clock_wakes_sleepers_in_step() {
        let tick = Duration::from_millis(100);
        let (mut clock, mut handle) = manual_clock();
        let start = clock.now();
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut deadline = start;
            loop {
                deadline += tick;
                clock.sleep_until(deadline).await;
                tx.send(()).expect("test receiver dropped");
            }
        });

        handle.advance(tick / 2);
        tokio::time::timeout(tick, rx.recv()).await.expect_err("no tick yet");

        handle.advance(tick);
        rx.recv().await.unwrap();

        handle.advance(tick * 2);
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        tokio::time::timeout(tick, rx.recv()).await.expect_err("no extra tick");

        assert_eq!(handle.elapsed(), tick * 7 / 2);
    }
}
