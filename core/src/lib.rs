//! The `skimmer-core` crate implements the load-aware replication fabric: a
//! coordinator that steers requests for hot keys across a dynamically managed
//! replica set, the versioned server store it steers to, and the wire
//! protocol that ties the two together.

pub mod client;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod decrementor;
pub mod fabric;
pub mod packet;
pub mod promotion;
pub mod result;
pub mod rset;
pub mod server;
pub mod service;
pub mod stats;
pub mod store;
pub mod streamer;
pub mod timing;
pub mod wire;
