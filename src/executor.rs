//! Single-threaded task queue.
//!
//! Tasks are `!Send` futures spawned with `async_task::spawn_local`. Their
//! wakers push the task back onto a shared queue and wake the reactor, so a
//! reply completed from anywhere gets its task polled on the next turn.

use std::cell::Cell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_task::Runnable;
use concurrent_queue::ConcurrentQueue;
use tracing::warn;

use crate::reactor::Notifier;

pub struct Executor {
    queue: Arc<ConcurrentQueue<Runnable>>,
    notifier: Notifier,
}

impl Executor {
    pub fn new(notifier: Notifier) -> Self {
        Self {
            queue: Arc::new(ConcurrentQueue::unbounded()),
            notifier,
        }
    }

    /// Schedule `future` to be polled on the next turn.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let queue = self.queue.clone();
        let notifier = self.notifier.clone();
        let schedule = move |runnable: Runnable| {
            if queue.push(runnable).is_ok() {
                notifier.notify();
            }
        };
        let (runnable, task) = async_task::spawn_local(future, schedule);
        task.detach();
        runnable.schedule();
    }

    /// Poll every task that was ready when the call started. Tasks woken
    /// while this runs wait for the next call. Returns how many ran.
    pub fn run_ready(&self) -> usize {
        let budget = self.queue.len();
        let mut ran = 0;
        for _ in 0..budget {
            let Ok(runnable) = self.queue.pop() else {
                break;
            };
            if let Err(message) = contain(|| runnable.run()) {
                warn!("Task failed: {}", message);
            }
            ran += 1;
        }
        ran
    }

    pub fn has_ready(&self) -> bool {
        !self.queue.is_empty()
    }
}

thread_local! {
    static CONTAINED: Cell<usize> = const { Cell::new(0) };
}

/// Run `f`, turning a panic into its message.
pub(crate) fn contain<R>(f: impl FnOnce() -> R) -> Result<R, String> {
    CONTAINED.with(|depth| depth.set(depth.get() + 1));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    CONTAINED.with(|depth| depth.set(depth.get() - 1));
    result.map_err(|payload| panic_message(&*payload))
}

/// True while the current thread is inside [`contain`].
pub fn panic_is_contained() -> bool {
    CONTAINED.with(|depth| depth.get() > 0)
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Let other tasks and pending I/O run before continuing.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    fn executor() -> Executor {
        let reactor: Reactor<()> = Reactor::new().unwrap();
        Executor::new(reactor.notifier())
    }

    #[test]
    fn test_spawn_and_run() {
        let executor = executor();
        let counter = Rc::new(Cell::new(0));
        let c = counter.clone();
        executor.spawn(async move { c.set(c.get() + 1) });

        assert!(executor.has_ready());
        assert_eq!(executor.run_ready(), 1);
        assert_eq!(counter.get(), 1);
        assert!(!executor.has_ready());
    }

    #[test]
    fn test_panicking_task_is_contained() {
        let executor = executor();
        let after = Rc::new(Cell::new(false));
        let a = after.clone();
        executor.spawn(async { panic!("handler blew up") });
        executor.spawn(async move { a.set(true) });

        assert_eq!(executor.run_ready(), 2);
        assert!(after.get());
    }

    #[test]
    fn test_contain_reports_message() {
        assert!(!panic_is_contained());
        let err = contain(|| -> () {
            assert!(panic_is_contained());
            panic!("boom")
        })
        .unwrap_err();
        assert_eq!(err, "boom");
        assert!(!panic_is_contained());
        assert_eq!(contain(|| 7), Ok(7));
    }

    #[test]
    fn test_yield_now_defers_to_next_round() {
        let executor = executor();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = log.clone();
        executor.spawn(async move {
            l.borrow_mut().push("a1");
            yield_now().await;
            l.borrow_mut().push("a2");
        });
        let l = log.clone();
        executor.spawn(async move { l.borrow_mut().push("b") });

        executor.run_ready();
        assert_eq!(*log.borrow(), vec!["a1", "b"]);
        assert!(executor.has_ready());
        executor.run_ready();
        assert_eq!(*log.borrow(), vec!["a1", "b", "a2"]);
    }
}
