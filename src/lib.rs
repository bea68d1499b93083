//! # minirpc - Multiplexed RPC over TCP
//!
//! Callers invoke `"Service.Method"` on a server-hosted receiver:
//! - One JSON handshake frame per connection selects the codec
//!   (MessagePack or JSON)
//! - The server reads requests on one loop per connection and runs each
//!   handler on its own task, serializing the responses
//! - The client shares one connection between any number of outstanding
//!   calls, matching responses by sequence number
//!
//! ## Architecture
//!
//! ```text
//!   Client::go ──► pending table ──► request frame ──►  reader loop
//!                                                          │
//!                                                   Registry::find
//!                                                          │
//!   done queue ◄── receive loop ◄── response frame ◄── handler task
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use minirpc::{Client, ClientConfig, Registry, Server, ServerConfig, Service};
//!
//! struct Foo;
//!
//! impl Foo {
//!     fn sum(&self, args: (i32, i32), reply: &mut i32) -> Result<(), String> {
//!         *reply = args.0 + args.1;
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> minirpc::Result<()> {
//! let mut registry = Registry::new();
//! registry.register(Service::builder(Foo).method("Sum", Foo::sum).build()?)?;
//! let server = Server::new(registry, ServerConfig::default());
//! tokio::spawn(async move { server.serve().await });
//!
//! let client = Client::dial("127.0.0.1:9999", ClientConfig::default()).await?;
//! let sum: i32 = client.call("Foo.Sum", (1, 2)).await?;
//! assert_eq!(sum, 3);
//! # Ok(())
//! # }
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod rpc;
pub mod types;

// Internal utilities
pub mod observability;

pub use rpc::{Call, Client, CodecType, Header, Registry, Server, Service};
pub use types::{ClientConfig, Config, Error, ObservabilityConfig, Result, ServerConfig};
