//! The capability a connection owner provides to the transport
//!
//! The engine implements this trait; the server, client, and read loops call
//! into it. Connections are handed over as `Arc` so handlers can keep them.

use std::sync::Arc;

use async_trait::async_trait;

use syncdev_proto::Message;

use crate::connection::PeerConnection;

#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// A connection completed its `Hello` and was installed in the registry.
    async fn on_connect(&self, conn: Arc<PeerConnection>);

    /// A connection's read loop ended and the registry entry was dropped.
    async fn on_disconnect(&self, conn: Arc<PeerConnection>);

    /// A message arrived on an established connection.
    async fn handle_message(&self, conn: Arc<PeerConnection>, msg: Message);
}
