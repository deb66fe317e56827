//! Isolated execution hosting.
//!
//! A host is a separate execution context (a bootstrap process, or an in-process boundary
//! on its own worker thread) that runs workload code on behalf of a supervisor. The
//! supervisor creates hosts through a [`HostFactory`], talks to them through a
//! [`HostClient`], and keeps them alive with heartbeats; each context disposes itself if
//! the heartbeats stop.

pub mod boundary;
pub mod client;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod naming;
pub mod resolve;
pub mod service;
pub mod watchdog;
pub mod workload;

mod sys;

#[cfg(unix)]
pub mod bootstrap;
#[cfg(unix)]
pub mod channel;
#[cfg(unix)]
pub mod process;

pub use boundary::{BoundaryHost, BoundaryHostFactory};
pub use client::{Host, HostClient, HostFactory, HostState, Teardown};
pub use config::{
    BindingRedirect, BootstrapConfig, CanonicalConfig, CodeBase, ConfigFragment, DependencyBinding,
    HostConfig, HostTimeouts,
};
pub use error::{Diagnostics, HostError, ServiceError};
pub use naming::ChannelName;
pub use resolve::{DependencyResolver, DirectoryBridge, ResolutionBridge, ResolvedDependency};
pub use service::{DisposeReason, HostService, LocalHostService, ObjectRef, ServiceCall};
pub use watchdog::Watchdog;
pub use workload::{
    EventSink, HostContext, HostEvent, HostedObject, NullSink, RuntimeSetup, WorkloadRegistry,
    WorkloadRuntime,
};

#[cfg(unix)]
pub use process::{ProcessHost, ProcessHostFactory};
