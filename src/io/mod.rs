// Socket plumbing: UDP bind, optional raw IPv4 framing, and the sink the
// send queue drains into.

pub mod udp;

use std::{future::Future, io, net::SocketAddr};

use crate::buffer::PooledBuffer;

/// Destination for outbound datagrams.
///
/// The buffer is lent mutably so a sink can write framing into its header
/// reservation before sending.
pub trait DatagramSink: Send + Sync + 'static {
    fn send_buffer(
        &self,
        buf: &mut PooledBuffer,
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send;
}

pub use udp::{bind_udp, open_outbound, Outbound};
