//! Context side of a process host. A bootstrap executable loads its generated
//! configuration and calls [`serve`] with its workload registry.

use std::io;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use isohost_contracts::{BOOTSTRAP_CONFIG_SCHEMA_VERSION, BOOTSTRAP_CONFIG_SUFFIX};
use log::{debug, warn};

use crate::channel::serve_connection;
use crate::config::BootstrapConfig;
use crate::resolve::{ConfigResolver, DependencyResolver, ShadowStore};
use crate::service::{DisposeReason, LocalHostService};
use crate::sys::pid_alive;
use crate::workload::{ContextInfo, WorkloadRegistry};
use crate::ChannelName;

const ACCEPT_TICK: Duration = Duration::from_millis(10);
const OWNER_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// `<exe>.config.json`.
pub fn config_path_for_exe(exe: &Path) -> PathBuf {
    let mut name = exe.as_os_str().to_os_string();
    name.push(BOOTSTRAP_CONFIG_SUFFIX);
    PathBuf::from(name)
}

/// Reads the configuration beside `exe`, or defaults when there is none. The channel name
/// on the command line must match the generated one.
pub fn load_config(exe: &Path, channel: &ChannelName) -> Result<BootstrapConfig> {
    let path = config_path_for_exe(exe);
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let dir = exe
                .parent()
                .with_context(|| format!("bootstrap path has no parent: {}", exe.display()))?;
            debug!("no configuration at {}; using defaults", path.display());
            return Ok(BootstrapConfig::defaults_for(channel, dir));
        }
        Err(err) => {
            return Err(err).with_context(|| format!("read bootstrap config: {}", path.display()))
        }
    };

    let config: BootstrapConfig = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse bootstrap config: {}", path.display()))?;
    if config.schema_version != BOOTSTRAP_CONFIG_SCHEMA_VERSION {
        anyhow::bail!(
            "bootstrap config schema_version mismatch: expected {BOOTSTRAP_CONFIG_SCHEMA_VERSION} got {:?}",
            config.schema_version
        );
    }
    if config.channel_name != channel.as_str() {
        anyhow::bail!(
            "channel name mismatch: --ipc={channel} but config is for {:?}",
            config.channel_name
        );
    }
    Ok(config)
}

/// Serves the call channel until the context is disposed, then reports why.
pub fn serve(config: BootstrapConfig, registry: WorkloadRegistry) -> Result<DisposeReason> {
    let shadow = match (config.shadow_copy, config.shadow_dir.as_ref()) {
        (true, Some(dir)) => Some(Arc::new(ShadowStore::at(dir)?)),
        (true, None) => Some(Arc::new(ShadowStore::temp()?)),
        (false, _) => None,
    };
    let resolver: Arc<dyn DependencyResolver> = Arc::new(
        ConfigResolver::new(&config.application_base_dir, config.dependencies.clone())
            .with_shadow(shadow.clone()),
    );

    let service = LocalHostService::start(
        registry,
        ContextInfo::from_bootstrap(&config),
        resolver,
        Some(config.watchdog_timeout()),
    )
    .context("start host service")?;
    let (done_tx, done_rx) = mpsc::channel::<DisposeReason>();
    service.set_on_dispose(move |reason| {
        let _ = done_tx.send(reason);
    });

    match std::fs::remove_file(&config.socket_path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => {
            return Err(err).with_context(|| {
                format!("remove stale socket: {}", config.socket_path.display())
            })
        }
        _ => {}
    }
    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("bind {}", config.socket_path.display()))?;
    listener
        .set_nonblocking(true)
        .context("set listener nonblocking")?;
    debug!(
        "host {} listening on {}",
        config.channel_name,
        config.socket_path.display()
    );

    if let Some(owner) = config.owner_pid {
        let service = service.clone();
        thread::Builder::new()
            .name("isohost-owner-monitor".to_string())
            .spawn(move || watch_owner(owner, service))
            .context("spawn owner monitor")?;
    }

    let reason = loop {
        match done_rx.try_recv() {
            Ok(reason) => break reason,
            Err(mpsc::TryRecvError::Disconnected) => break DisposeReason::Requested,
            Err(mpsc::TryRecvError::Empty) => {}
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = stream.set_nonblocking(false) {
                    warn!("dropping call connection: {err}");
                    continue;
                }
                let service = service.clone();
                let spawned = thread::Builder::new()
                    .name("isohost-call".to_string())
                    .spawn(move || {
                        if let Err(err) = serve_connection(stream, &service) {
                            debug!("call connection failed: {err}");
                        }
                    });
                if let Err(err) = spawned {
                    warn!("failed to spawn call thread: {err}");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_TICK),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                service.dispose_because(DisposeReason::Requested);
                let _ = std::fs::remove_file(&config.socket_path);
                return Err(err).context("accept call connection");
            }
        }
    };

    drop(listener);
    if let Err(err) = std::fs::remove_file(&config.socket_path) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!("failed to remove {}: {err}", config.socket_path.display());
        }
    }
    if let Some(shadow) = shadow {
        if let Err(err) = shadow.close() {
            warn!("failed to remove shadow copies: {err}");
        }
    }
    debug!("host {} exiting ({reason:?})", config.channel_name);
    Ok(reason)
}

fn watch_owner(owner: u32, service: LocalHostService) {
    while !service.is_disposed() {
        if !pid_alive(owner) {
            warn!("owner process {owner} is gone; host context disposing itself");
            service.dispose_because(DisposeReason::OwnerLost);
            return;
        }
        thread::sleep(OWNER_CHECK_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    use serde_json::json;

    use super::*;

    fn config_in(dir: &Path, channel: &ChannelName) -> BootstrapConfig {
        let mut cfg = BootstrapConfig::defaults_for(channel, dir);
        cfg.watchdog_timeout_ms = 10_000;
        cfg
    }

    #[test]
    fn config_path_appends_suffix() {
        assert_eq!(
            config_path_for_exe(Path::new("/x/isohost-bootstrap")),
            PathBuf::from("/x/isohost-bootstrap.config.json")
        );
    }

    #[test]
    fn load_config_defaults_and_checks_channel() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("isohost-bootstrap");
        let channel = ChannelName::parse("isohost-load").unwrap();

        let cfg = load_config(&exe, &channel).unwrap();
        assert_eq!(cfg.channel_name, "isohost-load");
        assert_eq!(cfg.application_base_dir, dir.path());

        std::fs::write(config_path_for_exe(&exe), serde_json::to_vec(&cfg).unwrap()).unwrap();
        load_config(&exe, &channel).unwrap();
        let other = ChannelName::parse("isohost-other").unwrap();
        let err = load_config(&exe, &other).unwrap_err();
        assert!(err.to_string().contains("channel name mismatch"), "{err}");
    }

    #[test]
    fn serves_calls_until_disposed_over_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let channel = ChannelName::parse("isohost-serve").unwrap();
        let mut cfg = config_in(dir.path(), &channel);
        cfg.properties
            .insert("ISOHOST_SERVE_ONLY_PROP".to_string(), "ctx".to_string());
        let socket = cfg.socket_path.clone();

        let mut reg = WorkloadRegistry::new();
        reg.register_callback("emit", |ctx, args| {
            ctx.emit("tick", args.clone());
            Ok(json!(ctx.property("ISOHOST_SERVE_ONLY_PROP")))
        });
        let server = thread::spawn(move || serve(cfg, reg).unwrap());

        let transport = crate::channel::IpcTransport::new(&socket, Duration::from_secs(2), None);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while transport.ping_within(Duration::from_millis(200)).is_err() {
            assert!(std::time::Instant::now() < deadline, "server never answered");
            thread::sleep(Duration::from_millis(10));
        }

        use crate::service::HostService;
        let mut events = Vec::new();
        let mut sink = |e: crate::workload::HostEvent| events.push(e);
        let out = transport.invoke_callback("emit", json!(3), &mut sink).unwrap();
        assert_eq!(out, json!("ctx"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, json!(3));

        transport.dispose().unwrap();
        assert_eq!(server.join().unwrap(), DisposeReason::Requested);
        assert!(!socket.exists());
        // Properties reach the context, never the serving process's environment.
        assert!(std::env::var_os("ISOHOST_SERVE_ONLY_PROP").is_none());
    }

    #[test]
    fn malformed_request_gets_an_error_reply() {
        let dir = tempfile::tempdir().unwrap();
        let channel = ChannelName::parse("isohost-malformed").unwrap();
        let cfg = config_in(dir.path(), &channel);
        let socket = cfg.socket_path.clone();
        let server = thread::spawn(move || serve(cfg, WorkloadRegistry::new()).unwrap());

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut stream = loop {
            match UnixStream::connect(&socket) {
                Ok(s) => break s,
                Err(_) => {
                    assert!(std::time::Instant::now() < deadline);
                    thread::sleep(Duration::from_millis(10));
                }
            }
        };
        let body = b"not json";
        stream.write_all(&9u32.to_le_bytes()).unwrap();
        stream.write_all(&(body.len() as u32).to_le_bytes()).unwrap();
        stream.write_all(body).unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).unwrap();
        assert_eq!(&reply[..4], &9u32.to_le_bytes());
        let text = String::from_utf8_lossy(&reply[8..]);
        assert!(text.contains("malformed request"), "{text}");

        let transport = crate::channel::IpcTransport::new(&socket, Duration::from_secs(2), None);
        use crate::service::HostService;
        transport.dispose().unwrap();
        server.join().unwrap();
    }
}
