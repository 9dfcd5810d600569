//! `flow-lock-service`: per-user Flow tab-lock service.
//!
//! Owns the enforcement engine and talks to the browser through a host shim
//! connected on a Unix domain socket at `$XDG_RUNTIME_DIR/flow-lock.sock`.
//! The wire format is newline-delimited JSON-RPC-lite in both directions:
//! the host forwards browser events and router commands, the service issues
//! browser-control calls back over the same connection.
//!
//! - [`protocol`]: wire types and method names
//! - [`host`]: outbound call correlation and the socket-backed browser
//! - [`ipc`]: listener, per-connection dispatch, storage mirroring

pub mod host;
pub mod ipc;
pub mod protocol;

/// Protocol version spoken on the host socket.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Default socket filename.
pub const SOCKET_FILENAME: &str = "flow-lock.sock";

/// Get the default socket path using XDG_RUNTIME_DIR.
///
/// Falls back to `/tmp/flow-lock-<username>.sock` if XDG_RUNTIME_DIR is not set.
pub fn default_socket_path() -> std::path::PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        std::path::PathBuf::from(runtime_dir).join(SOCKET_FILENAME)
    } else {
        let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
        std::path::PathBuf::from(format!("/tmp/flow-lock-{user}.sock"))
    }
}
