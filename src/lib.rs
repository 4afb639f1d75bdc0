pub mod client;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod crc16;
pub mod error;
pub mod resp;

pub use client::ClusterClient;
pub use cluster::pipeline::ClusterPipeline;
pub use config::ClusterConfig;
pub use error::{Error, Result};
pub use resp::types::RespValue;
