//! A length-prefixed TCP framing server.
//!
//! Frames on the wire are `opcode:i16 (LE) || body_len:i32 (LE) ||
//! body:bytes[body_len]`. This crate accepts connections, reassembles
//! frames from an arbitrary split of TCP reads, and publishes each
//! completed frame to handlers registered with [`Server::on_packet_received`].
//! Decoding the body, doing anything with it, sending data back, and
//! process-level configuration are all left to the embedding
//! application — see `config.rs`/`main.rs` in this crate's own binary
//! for one way to wire that up.
//!
//! ```no_run
//! use framed_tcp_server::{Server, ServerConfig};
//!
//! let server = Server::new(ServerConfig::default());
//! server.on_packet_received(Box::new(|opcode, body| {
//!     println!("received opcode {opcode} with {} byte body", body.len());
//! }));
//! server.start(7878).unwrap();
//! // ... run until some external shutdown trigger ...
//! server.stop(false);
//! ```

pub mod codec;
pub mod publish;
pub mod runtime;
pub mod server;

pub use codec::{FrameError, DEFAULT_MAX_BODY_LEN, HEADER_SIZE};
pub use publish::Handler;
pub use server::{Server, ServerConfig};
