use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, warn};

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    expired: AtomicBool,
}

struct State {
    deadline: Instant,
    stopped: bool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Context-side liveness timer. Fires `on_expire` once if no [`Watchdog::ping`] arrives
/// within the timeout.
pub struct Watchdog {
    shared: Arc<Shared>,
    timeout: Duration,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl Watchdog {
    pub fn start<F>(timeout: Duration, on_expire: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let timeout = timeout.max(Duration::from_millis(1));
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                deadline: Instant::now() + timeout,
                stopped: false,
            }),
            cond: Condvar::new(),
            expired: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("isohost-watchdog".to_string())
            .spawn(move || watch_loop(thread_shared, on_expire))?;
        let thread_id = handle.thread().id();

        Ok(Watchdog {
            shared,
            timeout,
            thread: Mutex::new(Some(handle)),
            thread_id,
        })
    }

    /// Pushes the deadline out by one full timeout. No effect after expiry or stop.
    pub fn ping(&self) {
        let mut st = self.shared.lock();
        if st.stopped {
            return;
        }
        st.deadline = Instant::now() + self.timeout;
        self.shared.cond.notify_all();
    }

    pub fn has_expired(&self) -> bool {
        self.shared.expired.load(Ordering::SeqCst)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Cancels the timer. Joins the timer thread unless called from it.
    pub fn stop(&self) {
        {
            let mut st = self.shared.lock();
            st.stopped = true;
            self.shared.cond.notify_all();
        }
        if thread::current().id() == self.thread_id {
            return;
        }
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("watchdog thread panicked");
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_loop<F: FnOnce()>(shared: Arc<Shared>, on_expire: F) {
    let mut st = shared.lock();
    loop {
        if st.stopped {
            return;
        }
        let now = Instant::now();
        if now >= st.deadline {
            break;
        }
        let wait = st.deadline - now;
        st = match shared.cond.wait_timeout(st, wait) {
            Ok((guard, _)) => guard,
            Err(e) => e.into_inner().0,
        };
    }
    st.stopped = true;
    shared.expired.store(true, Ordering::SeqCst);
    drop(st);

    debug!("watchdog expired; disposing host context");
    on_expire();
}
