//! A single-fire start gate shared by all workers of a run.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

#[derive(Debug, Default)]
struct State {
    released: bool,
    waiting: usize,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

/// Workers call [`StartSignal::wait`] before entering their loops; the orchestrator calls
/// [`StartSignal::release`] exactly once. Releasing again is a no-op.
#[derive(Clone, Debug, Default)]
pub struct StartSignal(Arc<Inner>);

impl StartSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the signal has been released. Returns immediately afterwards.
    pub fn wait(&self) {
        let mut state = self.0.state.lock();
        if state.released {
            return;
        }
        state.waiting += 1;
        // wake up anyone in `release_when` counting the parked workers
        self.0.cond.notify_all();
        while !state.released {
            self.0.cond.wait(&mut state);
        }
        state.waiting -= 1;
    }

    pub fn release(&self) {
        let mut state = self.0.state.lock();
        if !state.released {
            state.released = true;
            self.0.cond.notify_all();
        }
    }

    /// Block until `parties` threads are parked in [`StartSignal::wait`], then release them.
    pub fn release_when(&self, parties: usize) {
        let mut state = self.0.state.lock();
        while !state.released && state.waiting < parties {
            self.0.cond.wait(&mut state);
        }
        state.released = true;
        self.0.cond.notify_all();
    }

    pub fn is_released(&self) -> bool {
        self.0.state.lock().released
    }

    /// Number of threads currently parked on the signal.
    pub fn waiting(&self) -> usize {
        self.0.state.lock().waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn nobody_passes_before_release() {
        let signal = StartSignal::new();
        let passed = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let signal = signal.clone();
                let passed = passed.clone();
                std::thread::spawn(move || {
                    signal.wait();
                    passed.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        while signal.waiting() < 4 {
            std::thread::sleep(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(passed.load(Ordering::SeqCst), 0);

        signal.release();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(passed.load(Ordering::SeqCst), 4);
        assert_eq!(signal.waiting(), 0);
    }

    #[test]
    fn release_when_waits_for_all_parties() {
        let signal = StartSignal::new();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let signal = signal.clone();
                std::thread::spawn(move || signal.wait())
            })
            .collect();
        signal.release_when(3);
        assert!(signal.is_released());
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn release_is_single_fire() {
        let signal = StartSignal::new();
        signal.release();
        signal.release();
        signal.release_when(10);
        signal.wait();
        assert!(signal.is_released());
    }
}
