//! Classifying I/O errors into their handling policy: swallow, retry,
//! or surface.

use std::io;

/// True when the error means the *client* went away: nothing to send
/// anywhere, stop quietly.
pub fn is_client_abort(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// True for transient transport failures during relay communication;
/// these switch the relay scheme to TLS-only and retry rather than
/// surfacing.
pub fn is_transient_network(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::TimedOut
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::UnexpectedEof
    )
}
