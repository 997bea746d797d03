pub mod cell;
pub mod client;
pub mod config;
pub mod overlay;
pub mod protocol;
pub mod sync;
pub mod telemetry;
pub mod transport;
pub mod upload;
