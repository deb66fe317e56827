use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, error, info};

use crate::error::Diagnostics;
use crate::sys::hard_kill_pid_and_group;

pub(crate) const CONSOLE_CAP_BYTES: usize = 1024 * 1024;
const SPAWN_ETXTBSY_RETRIES: u32 = 10;
const POLL_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct ConsoleBuf {
    bytes: Vec<u8>,
    truncated: bool,
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// A spawned bootstrap process in its own process group, with its console captured.
pub(crate) struct ProcessTask {
    label: String,
    pid: u32,
    child: Option<Child>,
    status: Option<ExitStatus>,
    stdout: Arc<Mutex<ConsoleBuf>>,
    stderr: Arc<Mutex<ConsoleBuf>>,
    readers: Vec<JoinHandle<()>>,
}

impl ProcessTask {
    pub(crate) fn spawn(
        label: &str,
        program: &Path,
        args: &[String],
        cwd: &Path,
        envs: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut attempt = 0u32;
        let mut child = loop {
            let mut cmd = Command::new(program);
            cmd.args(args)
                .current_dir(cwd)
                .envs(envs)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            {
                use std::os::unix::process::CommandExt as _;
                unsafe {
                    cmd.pre_exec(|| {
                        if libc::setsid() == -1 && libc::setpgid(0, 0) == -1 {
                            return Err(std::io::Error::last_os_error());
                        }
                        Ok(())
                    });
                }
            }

            match cmd.spawn() {
                Ok(child) => break child,
                // A just-copied binary can still be open for writing in a forked sibling.
                Err(err)
                    if err.raw_os_error() == Some(libc::ETXTBSY)
                        && attempt < SPAWN_ETXTBSY_RETRIES =>
                {
                    attempt += 1;
                    thread::sleep(Duration::from_millis(10 * u64::from(attempt)));
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("spawn {}", program.display()));
                }
            }
        };

        let pid = child.id();
        let stdout = Arc::new(Mutex::new(ConsoleBuf::default()));
        let stderr = Arc::new(Mutex::new(ConsoleBuf::default()));
        let readers = kill_on_error(&mut child, |child| {
            let mut readers = Vec::with_capacity(2);
            if let Some(out) = child.stdout.take() {
                readers.push(spawn_reader(label, Stream::Stdout, out, Arc::clone(&stdout))?);
            }
            if let Some(err) = child.stderr.take() {
                readers.push(spawn_reader(label, Stream::Stderr, err, Arc::clone(&stderr))?);
            }
            Ok(readers)
        })?;
        debug!("spawned host {label} as pid {pid}");

        Ok(ProcessTask {
            label: label.to_string(),
            pid,
            child: Some(child),
            status: None,
            stdout,
            stderr,
            readers,
        })
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn is_running(&mut self) -> bool {
        if self.status.is_some() {
            return false;
        }
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("host {} exited ({status})", self.label);
                self.status = Some(status);
                false
            }
            Ok(None) => true,
            Err(_) => false,
        }
    }

    /// Waits up to `timeout` for exit. True once the process is gone.
    pub(crate) fn join(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_running() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(POLL_TICK);
        }
    }

    pub(crate) fn abort(&self) {
        if self.status.is_none() && self.child.is_some() {
            debug!("killing host {} process group {}", self.label, self.pid);
            hard_kill_pid_and_group(self.pid);
        }
    }

    /// Hands a still-running child to the background reaper.
    pub(crate) fn release_to_reaper(&mut self) {
        if self.status.is_some() {
            return;
        }
        if let Some(child) = self.child.take() {
            super::reaper::adopt(&self.label, child);
        }
    }

    /// Gives the console readers up to `timeout` to drain what the process wrote.
    pub(crate) fn settle_console(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.readers.iter().any(|r| !r.is_finished()) && Instant::now() < deadline {
            thread::sleep(POLL_TICK);
        }
        let (done, pending): (Vec<_>, Vec<_>) =
            self.readers.drain(..).partition(|r| r.is_finished());
        for r in done {
            let _ = r.join();
        }
        self.readers = pending;
    }

    pub(crate) fn diagnostics(&self) -> Diagnostics {
        let (stdout, stdout_truncated) = snapshot(&self.stdout);
        let (stderr, stderr_truncated) = snapshot(&self.stderr);
        Diagnostics {
            stdout,
            stderr,
            exit_code: self.status.map(exit_code),
            stdout_truncated,
            stderr_truncated,
        }
    }
}

/// Runs `f` on a freshly spawned child; if it fails, the child's group is killed and reaped
/// before the error is returned.
fn kill_on_error<T>(child: &mut Child, f: impl FnOnce(&mut Child) -> Result<T>) -> Result<T> {
    let res = f(child);
    if res.is_err() {
        hard_kill_pid_and_group(child.id());
        let _ = child.wait();
    }
    res
}

fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt as _;
    match status.code() {
        Some(code) => code,
        None => status.signal().map(|s| 128 + s).unwrap_or(1),
    }
}

fn snapshot(buf: &Mutex<ConsoleBuf>) -> (String, bool) {
    let b = buf.lock().unwrap_or_else(|e| e.into_inner());
    (String::from_utf8_lossy(&b.bytes).into_owned(), b.truncated)
}

fn spawn_reader<R: Read + Send + 'static>(
    label: &str,
    stream: Stream,
    src: R,
    sink: Arc<Mutex<ConsoleBuf>>,
) -> Result<JoinHandle<()>> {
    let label = label.to_string();
    let suffix = match stream {
        Stream::Stdout => "out",
        Stream::Stderr => "err",
    };
    thread::Builder::new()
        .name(format!("isohost-console-{suffix}"))
        .spawn(move || {
            let mut reader = BufReader::new(src);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\r', '\n']);
                match stream {
                    Stream::Stdout => info!("[{label}] {text}"),
                    Stream::Stderr => error!("[{label}] {text}"),
                }

                let mut b = sink.lock().unwrap_or_else(|e| e.into_inner());
                if b.truncated {
                    continue;
                }
                let room = CONSOLE_CAP_BYTES.saturating_sub(b.bytes.len());
                if line.len() <= room {
                    b.bytes.extend_from_slice(&line);
                } else {
                    b.bytes.extend_from_slice(&line[..room]);
                    b.truncated = true;
                }
            }
        })
        .context("spawn console reader thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessTask {
        ProcessTask::spawn(
            "test",
            Path::new("/bin/sh"),
            &["-c".to_string(), script.to_string()],
            &std::env::temp_dir(),
            &BTreeMap::from([("ISOHOST_TASK_TEST".to_string(), "42".to_string())]),
        )
        .unwrap()
    }

    #[test]
    fn captures_console_env_and_exit_code() {
        let mut task = sh("echo out-$ISOHOST_TASK_TEST; echo err >&2; exit 3");
        assert!(task.join(Duration::from_secs(5)));
        task.settle_console(Duration::from_secs(2));
        let d = task.diagnostics();
        assert_eq!(d.stdout, "out-42\n");
        assert_eq!(d.stderr, "err\n");
        assert_eq!(d.exit_code, Some(3));
        assert!(!d.stdout_truncated);
    }

    #[test]
    fn abort_kills_the_whole_group() {
        let mut task = sh("sleep 30 & sleep 30; wait");
        assert!(task.is_running());
        assert!(!task.join(Duration::from_millis(50)));
        task.abort();
        assert!(task.join(Duration::from_secs(5)));
        // Pipes close only once the backgrounded sleep is gone too.
        task.settle_console(Duration::from_secs(5));
        assert!(task.readers.is_empty());
        assert_eq!(task.diagnostics().exit_code, Some(128 + libc::SIGKILL));
    }

    #[test]
    fn failed_setup_kills_and_reaps_the_child() {
        use std::os::unix::process::CommandExt as _;
        let mut child = Command::new("/bin/sh")
            .args(["-c", "sleep 30"])
            .stdout(Stdio::piped())
            .process_group(0)
            .spawn()
            .unwrap();
        let err = kill_on_error(&mut child, |_| -> Result<()> {
            anyhow::bail!("no console reader")
        })
        .unwrap_err();
        assert!(err.to_string().contains("no console reader"));
        // Already reaped: try_wait reports the stored status.
        let status = child.try_wait().unwrap().expect("child was reaped");
        assert_eq!(exit_code(status), 128 + libc::SIGKILL);
    }

    #[test]
    fn console_capture_is_capped() {
        let mut task = sh("head -c 1100000 /dev/zero | tr '\\0' 'x'; echo");
        assert!(task.join(Duration::from_secs(10)));
        task.settle_console(Duration::from_secs(5));
        let d = task.diagnostics();
        assert_eq!(d.stdout.len(), CONSOLE_CAP_BYTES);
        assert!(d.stdout_truncated);
    }
}
