use std::io::{self, Write};
use std::os::unix::net::UnixStream;

use log::debug;

use super::frame::{read_frame, write_frame};
use super::ServerFrame;
use crate::service::{HostService, LocalHostService, ServiceCall, ServiceReply};
use crate::workload::{EventSink, HostEvent};
use crate::ServiceError;

/// Streams events to the caller as they are emitted. After the first write failure the
/// caller is gone and further events are dropped.
struct FrameSink<'a, W: Write + Send> {
    writer: &'a mut W,
    id: u32,
    broken: bool,
}

impl<W: Write + Send> EventSink for FrameSink<'_, W> {
    fn emit(&mut self, event: HostEvent) {
        if self.broken {
            return;
        }
        if let Err(err) = write_server_frame(self.writer, self.id, &ServerFrame::Event { event }) {
            debug!("dropping events for call {}: {err}", self.id);
            self.broken = true;
        }
    }
}

fn write_server_frame(w: &mut impl Write, id: u32, frame: &ServerFrame) -> io::Result<()> {
    let bytes = serde_json::to_vec(frame).map_err(io::Error::other)?;
    write_frame(w, id, &bytes)
}

/// Handles one call connection: a request frame in, event frames and a reply frame out.
pub(crate) fn serve_connection(mut stream: UnixStream, service: &LocalHostService) -> io::Result<()> {
    let Some((id, bytes)) = read_frame(&mut stream)? else {
        return Ok(());
    };

    let call = match serde_json::from_slice::<ServiceCall>(&bytes) {
        Ok(call) => call,
        Err(err) => {
            let reply = ServiceReply::from(Err(ServiceError::Failed(format!(
                "malformed request: {err}"
            ))));
            return write_server_frame(&mut stream, id, &ServerFrame::Reply { reply });
        }
    };

    // The reply must leave before the service tears itself (and the process) down.
    if matches!(call, ServiceCall::Dispose) {
        let reply = if service.is_disposed() {
            ServiceReply::from(Err(ServiceError::Disposed))
        } else {
            ServiceReply::from(Ok(serde_json::Value::Null))
        };
        let res = write_server_frame(&mut stream, id, &ServerFrame::Reply { reply });
        let _ = service.dispose();
        return res;
    }

    let result = {
        let mut sink = FrameSink {
            writer: &mut stream,
            id,
            broken: false,
        };
        service.call(call, &mut sink)
    };
    write_server_frame(
        &mut stream,
        id,
        &ServerFrame::Reply {
            reply: ServiceReply::from(result),
        },
    )
}
