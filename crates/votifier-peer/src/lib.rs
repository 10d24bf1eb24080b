//! Library entry points for the standalone Votifier daemon.

pub mod app;
pub mod config;
pub mod failure_log;
pub mod forward;
pub mod keyfiles;
pub mod receiver;
