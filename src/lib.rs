#![forbid(unsafe_code)]

pub mod cli;
pub mod commands;
pub mod config;
pub mod demux;
pub mod error;
pub mod export;
pub mod formats;
pub mod json_repair;
pub mod logging;
pub mod merge;
pub mod numbering;
pub mod outline;
pub mod paginate;
pub mod persist;
pub mod scenario;
pub mod session;
pub mod stream;
