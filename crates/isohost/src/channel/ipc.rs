use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::Value;

use super::frame::{read_frame, write_frame};
use super::ServerFrame;
use crate::service::{HostService, ServiceCall};
use crate::workload::{EventSink, NullSink};
use crate::ServiceError;

/// Supervisor side of a process host's call channel.
#[derive(Debug)]
pub struct IpcTransport {
    socket_path: PathBuf,
    ping_timeout: Duration,
    call_timeout: Option<Duration>,
    next_id: AtomicU32,
}

impl IpcTransport {
    pub fn new(socket_path: impl Into<PathBuf>, ping_timeout: Duration, call_timeout: Option<Duration>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ping_timeout,
            call_timeout,
            next_id: AtomicU32::new(1),
        }
    }

    /// A single ping bounded by `timeout`, used while waiting for readiness.
    pub fn ping_within(&self, timeout: Duration) -> Result<(), ServiceError> {
        self.roundtrip(&ServiceCall::Ping, Some(timeout), &mut NullSink)
            .map(|_| ())
    }

    fn roundtrip(
        &self,
        call: &ServiceCall,
        timeout: Option<Duration>,
        events: &mut dyn EventSink,
    ) -> Result<Value, ServiceError> {
        let op = call.op_name();
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));

        let mut stream = UnixStream::connect(&self.socket_path)
            .map_err(|e| ServiceError::channel(op, format!("connect {}: {e}", self.socket_path.display())))?;
        stream
            .set_read_timeout(timeout)
            .and_then(|_| stream.set_write_timeout(timeout))
            .map_err(|e| ServiceError::channel(op, e))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::to_vec(call).map_err(|e| ServiceError::channel(op, e))?;
        write_frame(&mut stream, id, &payload).map_err(|e| ServiceError::channel(op, e))?;

        loop {
            let Some((reply_id, bytes)) =
                read_frame(&mut stream).map_err(|e| ServiceError::channel(op, e))?
            else {
                return Err(ServiceError::channel(op, "connection closed before reply"));
            };
            if reply_id != id {
                return Err(ServiceError::channel(
                    op,
                    format!("reply id mismatch: sent {id}, got {reply_id}"),
                ));
            }
            let frame: ServerFrame =
                serde_json::from_slice(&bytes).map_err(|e| ServiceError::channel(op, e))?;
            match frame {
                ServerFrame::Event { event } => events.emit(event),
                ServerFrame::Reply { reply } => return reply.into_result(),
            }
        }
    }
}

impl HostService for IpcTransport {
    fn call(&self, call: ServiceCall, events: &mut dyn EventSink) -> Result<Value, ServiceError> {
        let timeout = match call {
            ServiceCall::Ping | ServiceCall::Dispose => Some(self.ping_timeout),
            _ => self.call_timeout,
        };
        self.roundtrip(&call, timeout, events)
    }
}
