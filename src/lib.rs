pub mod config;
pub mod domain;
pub mod paths;
pub mod session_daemon;
pub mod store;
