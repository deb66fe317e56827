use std::process::Child;
use std::sync::{mpsc, OnceLock};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

static REAPER: OnceLock<mpsc::Sender<(String, Child)>> = OnceLock::new();

/// Takes ownership of a bootstrap that outlived its forced join and waits on it in the
/// background so it never lingers as a zombie.
pub(crate) fn adopt(label: &str, child: Child) {
    let tx = REAPER.get_or_init(|| {
        let (tx, rx) = mpsc::channel::<(String, Child)>();
        if let Err(err) = thread::Builder::new()
            .name("isohost-reaper".to_string())
            .spawn(move || reap_loop(rx))
        {
            warn!("failed to start reaper thread: {err}");
        }
        tx
    });

    if let Err(mpsc::SendError((label, child))) = tx.send((label.to_string(), child)) {
        wait_detached(label, child);
    }
}

fn reap_loop(rx: mpsc::Receiver<(String, Child)>) {
    let mut adopted: Vec<(String, Child)> = Vec::new();
    let mut open = true;
    let tick = Duration::from_millis(250);

    while open || !adopted.is_empty() {
        match rx.recv_timeout(tick) {
            Ok(entry) => adopted.push(entry),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => open = false,
        }

        adopted.retain_mut(|(label, child)| match child.try_wait() {
            Ok(Some(status)) => {
                debug!("reaped host {label} ({status})");
                false
            }
            Ok(None) => true,
            Err(err) => err.raw_os_error() != Some(libc::ECHILD),
        });
    }
}

fn wait_detached(label: String, mut child: Child) {
    let spawned = thread::Builder::new()
        .name("isohost-reaper-wait".to_string())
        .spawn(move || {
            let _ = child.wait();
            debug!("reaped host {label}");
        });
    if let Err(err) = spawned {
        warn!("failed to start detached waiter: {err}");
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use std::process::Command;
    use std::time::Instant;

    use super::adopt;

    #[test]
    fn adopted_child_is_reaped() {
        let child = Command::new("sh").args(["-c", "exit 0"]).spawn().unwrap();
        let pid = libc::pid_t::try_from(child.id()).unwrap();
        adopt("test", child);

        // A zombie still answers kill(pid, 0); ESRCH means it was waited on.
        let deadline = Instant::now() + std::time::Duration::from_secs(3);
        loop {
            let r = unsafe { libc::kill(pid, 0) };
            if r == -1 && std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH) {
                break;
            }
            assert!(Instant::now() < deadline, "pid {pid} never reaped");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }
}
