pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod filter;
pub mod forwarder;
pub mod m3u8;
pub mod media;
pub mod model;
pub mod resolve;
pub mod retry;
pub mod tasks;
pub mod upload;
pub mod watch;

pub use error::{Error, Result};
