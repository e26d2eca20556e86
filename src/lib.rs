//! # DirectIP ingest for shipborne automated weather stations
//!
//! Receives Iridium short-burst-data messages delivered by the gateway's
//! DirectIP protocol, decodes E-SURFMAR Format #100 sensor payloads, stores
//! every delivery and publishes decoded observations.

pub mod api;
pub mod database;
pub mod publisher;
pub mod reprocess;
pub mod server;
pub mod sink;
pub mod source;
pub mod types;

#[derive(Debug, thiserror::Error)]
#[error("saws-ingest error")]
pub enum Error {
    Io(#[from] std::io::Error),
    Database(#[from] crate::database::Error),
    Publisher(#[from] crate::publisher::Error),
    Server(#[from] crate::server::Error),
}
