//! Obtain [RawConnection]s from any [commonware_runtime::Network].
//!
//! The runtime owns the actual transport (sockets in production, deterministic in-memory
//! pipes in tests). This module only pairs the [Sink] and [Stream] halves it hands out with the
//! address of the remote endpoint.

use crate::Error;
use commonware_runtime::{Listener as _, ListenerOf, Network, Sink, SinkOf, Stream, StreamOf};
use std::net::SocketAddr;
use tracing::debug;

/// An established, bidirectional byte connection to some remote endpoint.
///
/// A [RawConnection] is exclusively owned by the [Connection](crate::Connection) that wraps it.
/// Dropping the [Sink] half closes the transport.
pub struct RawConnection<Si: Sink, St: Stream> {
    address: SocketAddr,
    sink: Si,
    stream: St,
}

impl<Si: Sink, St: Stream> RawConnection<Si, St> {
    /// Pair the halves of a transport connected to `address`.
    pub fn new(address: SocketAddr, sink: Si, stream: St) -> Self {
        Self {
            address,
            sink,
            stream,
        }
    }

    /// Address of the remote endpoint.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Split into independently owned write and read halves.
    pub fn split(self) -> (Si, St) {
        (self.sink, self.stream)
    }
}

/// Dial `address` over `network`.
pub async fn dial<N: Network>(
    network: &N,
    address: SocketAddr,
) -> Result<RawConnection<SinkOf<N>, StreamOf<N>>, Error> {
    let (sink, stream) = network
        .dial(address)
        .await
        .map_err(|_| Error::ConnectionFailed)?;
    debug!(%address, "dialed");
    Ok(RawConnection::new(address, sink, stream))
}

/// Accepts [RawConnection]s on a bound address.
pub struct Listener<N: Network> {
    inner: ListenerOf<N>,
}

impl<N: Network> Listener<N> {
    /// Bind to `address` on `network`.
    pub async fn bind(network: &N, address: SocketAddr) -> Result<Self, Error> {
        let inner = network
            .bind(address)
            .await
            .map_err(|_| Error::BindFailed)?;
        Ok(Self { inner })
    }

    /// Wait for the next incoming connection.
    pub async fn accept(&mut self) -> Result<RawConnection<SinkOf<N>, StreamOf<N>>, Error> {
        let (address, sink, stream) = self
            .inner
            .accept()
            .await
            .map_err(|_| Error::ConnectionFailed)?;
        debug!(%address, "accepted");
        Ok(RawConnection::new(address, sink, stream))
    }

    /// The address this listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }
}
