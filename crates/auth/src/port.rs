use std::io;
use std::net::{Ipv4Addr, TcpListener};
use tracing::debug;

pub const LOOPBACK: Ipv4Addr = Ipv4Addr::LOCALHOST;
pub const CALLBACK_PATH: &str = "/callback";

/// Ports registered with the identity provider, in the order they are tried.
pub const DEFAULT_CALLBACK_PORTS: [u16; 5] = [3001, 51153, 53153, 55153, 57153];

pub fn redirect_uri(port: u16) -> String {
    format!("http://localhost:{}{}", port, CALLBACK_PATH)
}

/// Checks whether `port` is bindable right now by binding and releasing it.
///
/// The answer can be stale by the time the caller acts on it, so this is a
/// pre-filter only. Callers still bind for real and handle `AddrInUse`.
/// Failures other than `AddrInUse` do not count as occupied; the real bind
/// reports them.
pub fn is_occupied(port: u16) -> bool {
    match TcpListener::bind((LOOPBACK, port)) {
        Ok(listener) => {
            drop(listener);
            false
        }
        Err(e) if signals_occupied(&e) => {
            debug!("Port {} is in use: {}", port, e);
            true
        }
        Err(e) => {
            debug!("Port {} probe inconclusive: {}", port, e);
            false
        }
    }
}

fn signals_occupied(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::AddrInUse
}
