//! Background thread that purges a cache at a fixed interval

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    fn raise(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }
}

enum SchedulerState {
    Running {
        signal: Arc<StopSignal>,
        handle: JoinHandle<()>,
    },
    Stopped,
}

/// Periodic purge task owned by a cache
///
/// Started once at construction and stopped exactly once, either explicitly or when the
/// scheduler is dropped. Stopping an already stopped scheduler is an error.
pub(crate) struct PurgeScheduler {
    interval: Duration,
    state: Mutex<SchedulerState>,
}

impl PurgeScheduler {
    /// Spawn the purge thread. `purge` returns the number of entries it dropped.
    pub(crate) fn start<F>(interval: Duration, thread_name: &str, purge: F) -> Result<Self>
    where
        F: Fn() -> usize + Send + 'static,
    {
        let signal = Arc::new(StopSignal::default());
        let thread_signal = Arc::clone(&signal);

        let handle = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || run(interval, &thread_signal, purge))
            .map_err(|e| Error::configuration(format!("failed to spawn purge thread: {e}")))?;

        tracing::debug!(interval = ?interval, "Started purge scheduler");
        Ok(Self {
            interval,
            state: Mutex::new(SchedulerState::Running { signal, handle }),
        })
    }

    pub(crate) const fn interval(&self) -> Duration {
        self.interval
    }

    pub(crate) fn is_running(&self) -> bool {
        matches!(*self.state.lock(), SchedulerState::Running { .. })
    }

    /// Halt the purge thread and wait for it to exit.
    pub(crate) fn stop(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.lock(), SchedulerState::Stopped);
        match previous {
            SchedulerState::Running { signal, handle } => {
                signal.raise();
                // A panic inside the purge closure was already reported by the panic hook.
                let _ = handle.join();
                tracing::debug!("Stopped purge scheduler");
                Ok(())
            }
            SchedulerState::Stopped => Err(Error::AlreadyStopped),
        }
    }
}

impl Drop for PurgeScheduler {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

fn run<F>(interval: Duration, signal: &StopSignal, purge: F)
where
    F: Fn() -> usize,
{
    let mut stopped = signal.stopped.lock();
    let Some(mut next) = Instant::now().checked_add(interval) else {
        // Interval too large to represent: the first tick never comes.
        while !*stopped {
            signal.wake.wait(&mut stopped);
        }
        return;
    };
    loop {
        while !*stopped {
            if signal.wake.wait_until(&mut stopped, next).timed_out() {
                break;
            }
        }
        if *stopped {
            return;
        }

        let dropped = MutexGuard::unlocked(&mut stopped, &purge);
        tracing::debug!(dropped, "Purged cache");

        // Keep a fixed rate; skip ticks that were missed while purging.
        next += interval;
        let now = Instant::now();
        while next <= now {
            next += interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_scheduler(interval: Duration) -> (PurgeScheduler, Arc<AtomicUsize>) {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let scheduler = PurgeScheduler::start(interval, "test-purge", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            0
        })
        .unwrap();
        (scheduler, ticks)
    }

    #[test]
    fn test_purges_periodically() {
        let (scheduler, ticks) = counting_scheduler(Duration::from_millis(10));
        assert!(scheduler.is_running());
        assert_eq!(scheduler.interval(), Duration::from_millis(10));

        thread::sleep(Duration::from_millis(100));
        scheduler.stop().unwrap();
        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_stop_halts_purging() {
        let (scheduler, ticks) = counting_scheduler(Duration::from_millis(5));
        scheduler.stop().unwrap();
        assert!(!scheduler.is_running());

        let after_stop = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_double_stop_is_an_error() {
        let (scheduler, _ticks) = counting_scheduler(Duration::from_secs(60));
        scheduler.stop().unwrap();
        assert!(matches!(scheduler.stop(), Err(Error::AlreadyStopped)));
    }

    #[test]
    fn test_stop_does_not_wait_for_interval() {
        let (scheduler, ticks) = counting_scheduler(Duration::from_secs(3600));
        let started = Instant::now();
        scheduler.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_stops_thread() {
        let (scheduler, ticks) = counting_scheduler(Duration::from_millis(5));
        drop(scheduler);
        let after_drop = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), after_drop);
    }
}
