//! Fair-loss link: a bound UDP endpoint.
//!
//! Pass-through by design: frames are encoded and decoded here but nothing
//! is retried, deduplicated, or acknowledged. The fair-loss properties the
//! stack relies on (eventual receipt under repetition, finite duplication,
//! no creation) come from UDP itself.

use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tracing::{trace, warn};

use bobbin_core::codec::MAX_DATAGRAM;
use bobbin_core::frame::TransportFrame;

pub struct FairLossLink {
    socket: UdpSocket,
}

impl FairLossLink {
    /// Bind the local datagram endpoint.
    ///
    /// # Errors
    ///
    /// Returns the socket error if the address cannot be bound. Fatal at
    /// startup.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }

    /// The bound address, with the OS-assigned port resolved.
    ///
    /// # Errors
    ///
    /// Returns the socket error if the local address cannot be read.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Best-effort transmission. Oversized frames and transient socket
    /// errors are logged and dropped; the perfect link above retries by
    /// re-sending, not by observing failures here.
    pub async fn send(&self, frame: &TransportFrame, to: SocketAddr) {
        if frame.encoded_len() > MAX_DATAGRAM {
            warn!(%frame, len = frame.encoded_len(), "frame exceeds datagram limit, dropping");
            return;
        }
        if let Err(e) = self.socket.send_to(&frame.encode(), to).await {
            trace!(%frame, %to, error = %e, "send failed, dropping");
        }
    }

    /// Receive the next well-formed frame, blocking until one arrives.
    ///
    /// Malformed datagrams are dropped without surfacing an error, so a
    /// garbage packet cannot stall the receive loop.
    ///
    /// # Errors
    ///
    /// Returns the socket error if the receive itself fails.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(TransportFrame, SocketAddr)> {
        loop {
            let (len, from) = self.socket.recv_from(buf).await?;
            match TransportFrame::decode(bytes::Bytes::copy_from_slice(&buf[..len])) {
                Ok(frame) => return Ok((frame, from)),
                Err(e) => trace!(%from, len, error = %e, "dropping malformed datagram"),
            }
        }
    }
}
