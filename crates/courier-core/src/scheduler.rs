use crate::time::now_ms;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;

pub type Task = BoxFuture<'static, ()>;

pub trait Scheduler: Send + Sync {
    fn now_ms(&self) -> u64;
    fn after(&self, delay: Duration, task: Task) -> TimerHandle;
}

#[derive(Clone, Debug, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(abort) = self.abort.as_ref() {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn now_ms(&self) -> u64 {
        now_ms()
    }

    fn after(&self, delay: Duration, task: Task) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::SeqCst) {
                task.await;
            }
        });
        TimerHandle {
            cancelled,
            abort: Some(handle.abort_handle()),
        }
    }
}

struct Pending {
    due_ms: u64,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    task: Task,
}

#[derive(Clone, Default)]
pub struct ManualScheduler {
    now: Arc<AtomicU64>,
    seq: Arc<AtomicU64>,
    queue: Arc<Mutex<Vec<Pending>>>,
}

impl ManualScheduler {
    pub fn starting_at(now_ms: u64) -> Self {
        let scheduler = Self::default();
        scheduler.now.store(now_ms, Ordering::SeqCst);
        scheduler
    }

    pub fn pending(&self) -> usize {
        match self.queue.lock() {
            Ok(queue) => queue
                .iter()
                .filter(|p| !p.cancelled.load(Ordering::SeqCst))
                .count(),
            Err(_) => 0,
        }
    }

    /// Moves the clock forward, running every task that falls due on the way
    /// in due order. Tasks scheduled while advancing run too if they are due
    /// before the target.
    pub async fn advance(&self, by: Duration) {
        let target = self
            .now
            .load(Ordering::SeqCst)
            .saturating_add(by.as_millis() as u64);
        while let Some(next) = self.pop_due(target) {
            let current = self.now.load(Ordering::SeqCst);
            self.now.store(next.due_ms.max(current), Ordering::SeqCst);
            if !next.cancelled.load(Ordering::SeqCst) {
                next.task.await;
            }
        }
        self.now.store(target, Ordering::SeqCst);
    }

    fn pop_due(&self, target: u64) -> Option<Pending> {
        let mut queue = self.queue.lock().ok()?;
        let position = queue
            .iter()
            .enumerate()
            .filter(|(_, p)| p.due_ms <= target)
            .min_by_key(|(_, p)| (p.due_ms, p.seq))
            .map(|(idx, _)| idx)?;
        Some(queue.remove(position))
    }
}

impl Scheduler for ManualScheduler {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn after(&self, delay: Duration, task: Task) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let due_ms = self
            .now
            .load(Ordering::SeqCst)
            .saturating_add(delay.as_millis() as u64);
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut queue) = self.queue.lock() {
            queue.push(Pending {
                due_ms,
                seq,
                cancelled: cancelled.clone(),
                task,
            });
        }
        TimerHandle {
            cancelled,
            abort: None,
        }
    }
}
