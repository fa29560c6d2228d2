pub mod client;
pub mod matcher;
pub mod rate_gate;
pub mod spatial;
