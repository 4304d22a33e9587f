use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info};
use parking_lot::{Condvar, Mutex};

use super::PageEvictioner;

#[derive(Default)]
struct WorkerState {
    wakeup_requested: bool,
    /// A round is running right now.
    busy: bool,
    /// Completed `do_work` rounds.
    rounds: u64,
}

struct WorkerShared {
    state: Mutex<WorkerState>,
    wakeup: Condvar,
    round_done: Condvar,
}

/// Background thread that runs an evictioner's `do_work` every interval
/// or whenever it is woken up.
///
/// An error from `do_work` means the pool can no longer make progress; the
/// worker logs it and aborts the process.
pub struct EvictionWorker {
    evictioner: Arc<dyn PageEvictioner>,
    shared: Arc<WorkerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EvictionWorker {
    pub fn start(
        evictioner: Arc<dyn PageEvictioner>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        evictioner.core().set_should_exit(false);
        let shared = Arc::new(WorkerShared {
            state: Mutex::new(WorkerState::default()),
            wakeup: Condvar::new(),
            round_done: Condvar::new(),
        });
        let handle = {
            let evictioner = Arc::clone(&evictioner);
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("page-evictioner".into())
                .spawn(move || run(evictioner, shared, interval))?
        };
        info!("eviction worker started, interval {interval:?}");
        Ok(Self {
            evictioner,
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Requests an immediate round. With `wait`, blocks until a round that
    /// started after this call has finished.
    pub fn wakeup(&self, wait: bool) {
        let mut state = self.shared.state.lock();
        // a round already running may have missed this request
        let target = state.rounds + 1 + u64::from(state.busy);
        state.wakeup_requested = true;
        self.shared.wakeup.notify_one();
        if !wait {
            return;
        }
        while state.rounds < target && !self.evictioner.core().should_exit() {
            self.shared.round_done.wait(&mut state);
        }
    }

    pub fn rounds(&self) -> u64 {
        self.shared.state.lock().rounds
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stops the thread and waits for it to exit.
    pub fn stop(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        self.evictioner.stop();
        {
            let mut state = self.shared.state.lock();
            state.wakeup_requested = true;
            self.shared.wakeup.notify_all();
            self.shared.round_done.notify_all();
        }
        if handle.join().is_err() {
            error!("eviction worker panicked");
        }
        info!("eviction worker stopped");
    }
}

impl Drop for EvictionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(evictioner: Arc<dyn PageEvictioner>, shared: Arc<WorkerShared>, interval: Duration) {
    loop {
        {
            let mut state = shared.state.lock();
            if !state.wakeup_requested {
                shared.wakeup.wait_for(&mut state, interval);
            }
            state.wakeup_requested = false;
            state.busy = true;
        }
        if evictioner.core().should_exit() {
            shared.state.lock().busy = false;
            break;
        }
        if let Err(e) = evictioner.do_work() {
            error!("eviction worker failed: {e}");
            std::process::abort();
        }
        let mut state = shared.state.lock();
        state.rounds += 1;
        state.busy = false;
        shared.round_done.notify_all();
    }
}
