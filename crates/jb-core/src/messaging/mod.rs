//! Chat-platform abstractions (the host adapter today; a native client later).

pub mod port;
pub mod throttled;
pub mod types;
