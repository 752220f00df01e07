//! Demo object server behind `busloop serve`.
//!
//! Listens on a bus socket and serves `/org/busloop/Echo` to one peer at a
//! time. When the peer hangs up the connection is closed and the next peer
//! is accepted; SIGINT stops the server.

use std::fs;
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::{Bus, BusKind, Connection, Stop};
use crate::codec::Value;
use crate::config::Config;
use crate::dispatch::{Invocation, MethodEntry, SignalEntry};
use crate::error::BusError;
use crate::executor::yield_now;

pub const ECHO_PATH: &str = "/org/busloop/Echo";
pub const ECHO_INTERFACE: &str = "org.busloop.Echo";

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Server already listening on {0}")]
    AlreadyRunning(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Register the Echo object on `conn`.
pub fn register_echo(conn: &Connection) -> Result<(), BusError> {
    conn.register_method(
        ECHO_PATH,
        ECHO_INTERFACE,
        "Echo",
        MethodEntry::new(|inv: Invocation| async move { Ok(inv.args) })
            .input("s")
            .output("s"),
    )?;

    conn.register_method(
        ECHO_PATH,
        ECHO_INTERFACE,
        "Add",
        MethodEntry::new(|inv: Invocation| async move {
            let a = inv.args.first().and_then(Value::as_i64).unwrap_or(0);
            let b = inv.args.get(1).and_then(Value::as_i64).unwrap_or(0);
            let sum = i32::try_from(a + b).map_err(|_| format!("{} + {} overflows int32", a, b))?;
            Ok(vec![Value::Int32(sum)])
        })
        .input("ii")
        .output("i"),
    )?;

    conn.register_method(
        ECHO_PATH,
        ECHO_INTERFACE,
        "Slow",
        MethodEntry::new(|inv: Invocation| async move {
            let turns = inv.args.first().and_then(Value::as_u64).unwrap_or(0);
            for _ in 0..turns {
                yield_now().await;
            }
            Ok(vec![Value::Str(format!("done after {} turns", turns))])
        })
        .input("u")
        .output("s"),
    )?;

    Ok(())
}

pub struct Daemon {
    config: Config,
    kind: BusKind,
}

impl Daemon {
    pub fn new(config: Config, kind: BusKind) -> Self {
        Self { config, kind }
    }

    pub fn socket_path(&self) -> &Path {
        self.config.socket_path(self.kind)
    }

    /// Bind the bus socket, replacing a stale one left by a dead server.
    pub fn bind(&self) -> Result<UnixListener, DaemonError> {
        let path = self.socket_path();
        if path.exists() {
            if UnixStream::connect(path).is_ok() {
                return Err(DaemonError::AlreadyRunning(path.to_path_buf()));
            }
            debug!("Removing stale socket {}", path.display());
            fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(UnixListener::bind(path)?)
    }

    /// Serve peers until interrupted.
    pub fn run(self) -> Result<(), DaemonError> {
        let listener = self.bind()?;
        info!("Serving {} on {}", ECHO_PATH, self.socket_path().display());

        let bus = Bus::new(&self.config)?;
        let result = loop {
            let stream = match listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e.into()),
            };
            match serve_peer(&bus, stream) {
                Ok(Stop::Quit) => continue,
                Ok(Stop::Interrupt) => break Ok(()),
                Err(e) => warn!("Peer session failed: {}", e),
            }
        };

        if let Err(e) = fs::remove_file(self.socket_path()) {
            debug!("Failed to remove socket: {}", e);
        }
        info!("Server stopped");
        result
    }
}

/// Serve one peer until it hangs up or the loop is interrupted.
pub fn serve_peer(bus: &Bus, stream: UnixStream) -> Result<Stop, BusError> {
    let conn = bus.open_stream(stream)?;
    info!("Peer connected as {}", conn.unique_name()?);
    register_echo(&conn)?;

    let quit = bus.clone();
    conn.on_disconnect(SignalEntry::new(move |_| {
        let bus = quit.clone();
        async move { bus.quit() }
    }))?;

    let stop = bus.run();
    conn.close()?;
    if stop.is_ok() {
        info!("Peer session ended");
    }
    stop
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::MethodCall;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.bus.session_socket = dir.path().join("session.sock");
        config.reactor.handle_sigint = false;
        config
    }

    #[test]
    fn test_bind_replaces_stale_socket() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new(test_config(&dir), BusKind::Session);

        let first = daemon.bind().unwrap();
        drop(first);
        assert!(daemon.socket_path().exists());

        assert!(daemon.bind().is_ok());
    }

    #[test]
    fn test_bind_refuses_live_socket() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new(test_config(&dir), BusKind::Session);

        let _live = daemon.bind().unwrap();
        assert!(matches!(
            daemon.bind(),
            Err(DaemonError::AlreadyRunning(_))
        ));
    }

    #[test]
    fn test_echo_object_serves_one_peer() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (server_side, client_side) = UnixStream::pair().unwrap();

        let server_config = config.clone();
        let server = std::thread::spawn(move || {
            let bus = Bus::new(&server_config).unwrap();
            serve_peer(&bus, server_side).unwrap()
        });

        let bus = Bus::new(&config).unwrap();
        let conn = bus.open_stream(client_side).unwrap();
        let call = |member: &str| {
            MethodCall::new(":1.0", ECHO_PATH, ECHO_INTERFACE, member).unwrap()
        };

        let reply = conn
            .call_blocking(call("Add").signature("ii").arg(2).arg(40))
            .unwrap();
        assert_eq!(reply, Ok(vec![Value::Int32(42)]));

        let reply = conn
            .call_blocking(call("Echo").signature("s").arg("hi"))
            .unwrap();
        assert_eq!(reply, Ok(vec![Value::Str("hi".into())]));

        let reply = conn
            .call_blocking(call("Slow").signature("u").arg(3u32))
            .unwrap();
        assert_eq!(reply, Ok(vec![Value::Str("done after 3 turns".into())]));

        let overflow = conn
            .call_blocking(call("Add").signature("ii").arg(i32::MAX).arg(1))
            .unwrap()
            .unwrap_err();
        assert_eq!(overflow.name, crate::message::error_names::FAILED);

        conn.close().unwrap();
        assert_eq!(server.join().unwrap(), Stop::Quit);
    }
}
