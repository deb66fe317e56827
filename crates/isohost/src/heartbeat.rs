use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::warn;

use crate::HostError;

/// Supervisor-side periodic task. Each beat's failure is logged, never propagated.
pub struct Heartbeat {
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn start<F>(name: &str, interval: Duration, mut beat: F) -> std::io::Result<Self>
    where
        F: FnMut() -> Result<(), HostError> + Send + 'static,
    {
        let interval = interval.max(Duration::from_millis(1));
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let label = name.to_string();
        let thread = thread::Builder::new()
            .name(format!("isohost-heartbeat-{name}"))
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if let Err(err) = beat() {
                            warn!("heartbeat for host {label} failed: {err}");
                        }
                    }
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
                }
            })?;
        Ok(Heartbeat {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Stops the timer and waits for an in-flight beat to finish.
    pub fn stop(&mut self) {
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("heartbeat thread panicked");
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::ServiceError;

    #[test]
    fn beats_until_stopped_and_swallows_failures() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let mut hb = Heartbeat::start("test", Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
            Err(HostError::from(ServiceError::Channel("gone".to_string())))
        })
        .unwrap();
        thread::sleep(Duration::from_millis(120));
        hb.stop();
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "only {seen} beats");
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }
}
