//! Configuration: tuning constants and the typed config structs handed to
//! each component constructor. Parsing a config file into these structs is
//! the host process's job, not ours.

pub mod constants;
pub mod types;

pub use constants::{
    CONNECT_FIRST_READ_BYTES, FETCH_RETRIES, FORWARD_BUFSIZE, FORWARD_IDLE_TIMEOUT_SECS,
    MAX_DEFLATE_BODY_BYTES, MAX_RESPONSE_HEAD_BYTES, RELAY_BODY_READ_TIMEOUT_SECS,
};
pub use types::{
    AutorangeConfig, ProxyConfig, RacerConfig, RangeConfig, RelayOptions, RelayScheme,
    ResolverConfig, SniOverride,
};
