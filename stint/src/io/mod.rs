//! Side-effecting adapters: filesystem, processes, model backend, tools.

pub mod config;
pub mod gateway;
pub mod init;
pub mod journal;
pub mod log_store;
pub mod model;
pub mod process;
pub mod prompt;
pub mod tools;
pub mod validation;
