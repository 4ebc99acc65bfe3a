//! Readiness notifications to the service manager over `$NOTIFY_SOCKET`.

use std::env;
use std::io;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixDatagram};

use tracing::{debug, warn};

pub const NOTIFY_SOCKET: &str = "NOTIFY_SOCKET";

/// Sends `name=value` state updates. Does nothing when not run under a
/// service manager.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    socket: Option<String>,
}

impl Notifier {
    pub fn from_env() -> Self {
        Notifier {
            socket: env::var(NOTIFY_SOCKET).ok().filter(|s| !s.is_empty()),
        }
    }

    pub fn with_socket(socket: impl Into<String>) -> Self {
        Notifier {
            socket: Some(socket.into()),
        }
    }

    pub fn ready(&self) {
        self.send_logged("READY=1");
    }

    pub fn stopping(&self) {
        self.send_logged("STOPPING=1");
    }

    fn send_logged(&self, state: &str) {
        match self.send(state) {
            Ok(true) => debug!(state, "Notified service manager"),
            Ok(false) => {}
            Err(e) => warn!(state, error = %e, "Failed to notify service manager"),
        }
    }

    /// Returns `Ok(false)` when there is no socket to notify.
    pub fn send(&self, state: &str) -> io::Result<bool> {
        let Some(socket) = self.socket.as_deref() else {
            return Ok(false);
        };
        let addr = match socket.strip_prefix('@') {
            Some(abstract_name) => SocketAddr::from_abstract_name(abstract_name.as_bytes())?,
            None => SocketAddr::from_pathname(socket)?,
        };
        let datagram = UnixDatagram::unbound()?;
        datagram.send_to_addr(state.as_bytes(), &addr)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_without_socket_is_a_noop() {
        assert!(!Notifier::default().send("READY=1").unwrap());
    }

    #[test]
    fn test_notify_sends_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let listener = UnixDatagram::bind(&path).unwrap();

        let notifier = Notifier::with_socket(path.to_str().unwrap());
        notifier.ready();
        notifier.stopping();

        let mut buf = [0u8; 64];
        let n = listener.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"READY=1");
        let n = listener.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"STOPPING=1");
    }
}
