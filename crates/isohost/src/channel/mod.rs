//! Call channel for process hosts: one Unix-domain socket connection per call, each
//! carrying length-prefixed JSON frames.

mod frame;
mod ipc;
mod server;

use serde::{Deserialize, Serialize};

use crate::service::ServiceReply;
use crate::workload::HostEvent;

pub use ipc::IpcTransport;
pub(crate) use server::serve_connection;

/// What the context side writes back on a call connection: any number of events, then
/// exactly one reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub(crate) enum ServerFrame {
    Event { event: HostEvent },
    Reply { reply: ServiceReply },
}
