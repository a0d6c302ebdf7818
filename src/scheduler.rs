// Background loop with an explicit start/stop lifecycle

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

struct RunningTask {
    stop: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// Runs `tick` every `period` until stopped.
///
/// Each tick is spawned as its own task, so stopping the loop never cancels
/// work a tick already dispatched. Dropping the task stops the loop too.
pub struct PeriodicTask {
    name: &'static str,
    running: Mutex<Option<RunningTask>>,
}

impl PeriodicTask {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Mutex::new(None),
        }
    }

    /// Start the loop. Returns `false` if it is already running.
    pub fn start<F, Fut>(&self, period: Duration, run_immediately: bool, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock();
        if let Some(task) = running.as_ref() {
            if !task.join.is_finished() {
                return false;
            }
        }

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let name = self.name;
        let period = period.max(Duration::from_millis(1));
        let join = tokio::spawn(async move {
            let first = if run_immediately {
                Instant::now()
            } else {
                Instant::now() + period
            };
            let mut interval = tokio::time::interval_at(first, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => {
                        tokio::spawn(tick());
                    }
                }
            }
            tracing::debug!("[{}] loop exited", name);
        });

        *running = Some(RunningTask {
            stop: stop_tx,
            join,
        });
        tracing::info!("[{}] started, period {:?}", self.name, period);
        true
    }

    /// Stop the loop and wait for it to exit. Safe to call when never started.
    pub async fn stop(&self) -> bool {
        let task = self.running.lock().take();
        let Some(task) = task else {
            return false;
        };
        let _ = task.stop.send(());
        if let Err(e) = task.join.await {
            tracing::warn!("[{}] loop ended abnormally: {}", self.name, e);
        }
        tracing::info!("[{}] stopped", self.name);
        true
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map(|task| !task.join.is_finished())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let task = PeriodicTask::new("test");
        assert!(!task.stop().await);
        assert!(!task.stop().await);
        assert!(!task.is_running());
    }

    #[tokio::test]
    async fn runs_immediately_and_stops() {
        let task = PeriodicTask::new("test");
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        assert!(task.start(Duration::from_secs(3600), true, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));
        assert!(task.is_running());
        assert!(!task.start(Duration::from_secs(3600), true, || async {}));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(task.stop().await);
        assert!(!task.is_running());
        assert!(!task.stop().await);
    }

    #[tokio::test]
    async fn in_flight_tick_survives_stop() {
        let task = PeriodicTask::new("test");
        let done = Arc::new(AtomicUsize::new(0));
        let flag = done.clone();
        task.start(Duration::from_secs(3600), true, move || {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                flag.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        task.stop().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
