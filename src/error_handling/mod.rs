//! Error types, categorization helpers, and failure counters.

pub mod categorization;
pub mod stats;
pub mod types;

pub use categorization::{is_client_abort, is_transient_network};
pub use stats::TunnelStats;
pub use types::{ConnectError, ErrorKind, FrameSection, RangeError, ResolveError, TunnelError};
