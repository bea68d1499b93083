//! RPC over a byte stream: handshake, frame codec, registry, server, client.
//!
//! Each connection starts with a JSON options frame announcing the codec,
//! followed by header/body frame pairs in that codec.

pub mod client;
pub mod codec;
pub mod handshake;
pub mod registry;
pub mod server;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{done_channel, Call, Client};
pub use codec::{CodecType, Header};
pub use handshake::{Options, MAGIC_NUMBER};
pub use registry::{MethodType, Registry, Service, ServiceBuilder};
pub use server::Server;
