mod cache;
mod channel;
mod config;
mod delivery;
mod duplicates;
mod handshake;
mod handshaker;
mod neighbor_finder;
mod neighbor_update;
mod network;
mod node_list;
mod paused;
mod plumtree;
mod propagation;
mod proxy;
mod remote;
mod stream_part;

pub mod discovery;
pub mod inspect;
pub mod rpc;
pub mod wire;

#[cfg(test)]
mod testing;

pub use {
  config::Config,
  duplicates::{DuplicateMessageDetector, NumberPair},
  network::{Error, Network},
  stream_part::{
    DiagnosticInfo,
    Error as StreamPartError,
    StreamPart,
    StreamPartEvent,
  },
};
