//! Authenticated TCP transport between syncdev peers
//!
//! A [`PeerConnection`] frames newline-delimited JSON messages over a TCP
//! stream and enforces HMAC authentication once a shared secret is armed.
//! The [`ConnectionRegistry`] keeps at most one live connection per peer id;
//! [`Server`] accepts inbound connections and [`Client`] dials outbound ones,
//! both handing established connections to a [`ConnectionHandler`].

pub mod client;
pub mod connection;
pub mod errors;
pub mod handler;
pub mod registry;
pub mod server;

pub use client::Client;
pub use connection::PeerConnection;
pub use errors::{NetError, Result};
pub use handler::ConnectionHandler;
pub use registry::{run_read_loop, ConnectionRegistry};
pub use server::Server;
