pub mod config;
pub mod context;
pub mod error;
pub mod knock;
pub mod session;
pub mod transport;
pub mod tunnel;
pub mod version;
