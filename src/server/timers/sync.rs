use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A deadline cell shared between a timer handle and its task. The handle
/// replaces the deadline to push the next wake-up out; the task takes it to
/// decide whether it slept to a real timeout or was pre-empted.
#[derive(Clone)]
pub(crate) struct SharedDeadline<T> {
    cell: Arc<Mutex<Option<T>>>,
}

impl<T> SharedDeadline<T> {
    pub(crate) fn empty() -> Self {
        SharedDeadline {
            cell: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn set(&self, deadline: T) {
        self.cell.lock().expect("deadline cell poisoned").replace(deadline);
    }

    pub(crate) fn take(&self) -> Option<T> {
        self.cell.lock().expect("deadline cell poisoned").take()
    }
}

/// Cancellation pair: dropping the guard flips the flag, and the timer task
/// checks the flag after every wake-up before acting. The task is guaranteed
/// to observe the latest cancel state before firing.
pub(crate) struct CancelGuard {
    flag: Arc<AtomicBool>,
}

pub(crate) struct CancelFlag {
    flag: Arc<AtomicBool>,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.flag.store(true, Ordering::Release);
    }
}

impl CancelFlag {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

pub(crate) fn cancel_pair() -> (CancelGuard, CancelFlag) {
    let flag = Arc::new(AtomicBool::new(false));
    (CancelGuard { flag: flag.clone() }, CancelFlag { flag })
}
