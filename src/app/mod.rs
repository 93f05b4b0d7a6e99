pub mod adb;
pub mod cli;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod logging;
pub mod models;
pub mod server;
pub mod session;
pub mod watch;
