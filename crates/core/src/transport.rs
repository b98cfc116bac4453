//! Unreliable, unordered datagram transport (§4.2): a real `UdpSocket` for
//! production use, or an in-process loopback pair of bounded ring queues for
//! tests and same-process client/server demos.

use std::collections::VecDeque;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};

use crate::error::{socket_error, NetError, NetResult};
use crate::protocol::MTU;

/// Bound on a loopback queue's depth, mirroring a kernel socket buffer:
/// once a stalled peer's queue fills, further sends fail with
/// [`NetError::Full`] rather than growing without limit (§4.2, §7).
const LOOPBACK_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub from: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Common send/receive surface both transport backends implement.
pub trait Transport {
    fn local_addr(&self) -> SocketAddr;
    fn send_to(&self, addr: SocketAddr, bytes: &[u8]) -> NetResult<()>;
    /// Drains all datagrams currently available without blocking.
    fn recv_all(&self) -> Vec<Datagram>;
}

pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpTransport {
    pub fn bind(addr: SocketAddr) -> NetResult<Self> {
        let socket = UdpSocket::bind(addr).map_err(|e| socket_error(addr, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| socket_error(addr, e))?;
        let local_addr = socket.local_addr().map_err(|e| socket_error(addr, e))?;
        Ok(Self { socket, local_addr })
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn send_to(&self, addr: SocketAddr, bytes: &[u8]) -> NetResult<()> {
        if bytes.is_empty() {
            return Err(NetError::InvalidParam("payload empty".into()));
        }
        if bytes.len() > MTU {
            return Err(NetError::InvalidParam(format!(
                "payload {} bytes exceeds MTU {}",
                bytes.len(),
                MTU
            )));
        }
        self.socket
            .send_to(bytes, addr)
            .map_err(|e| socket_error(addr, e))?;
        Ok(())
    }

    fn recv_all(&self) -> Vec<Datagram> {
        let mut out = Vec::new();
        let mut buf = [0u8; MTU];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => out.push(Datagram {
                    from,
                    bytes: buf[..n].to_vec(),
                }),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        out
    }
}

/// A shared in-process router: any number of [`LoopbackTransport`]
/// endpoints can register an address and exchange datagrams, the way a
/// LAN segment would, without opening a real socket.
#[derive(Default)]
pub struct LoopbackNetwork {
    queues: Mutex<std::collections::HashMap<SocketAddr, VecDeque<Datagram>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `addr` and returns a transport endpoint for it.
    pub fn endpoint(self: &Arc<Self>, addr: SocketAddr) -> LoopbackTransport {
        self.queues.lock().expect("loopback queue poisoned").entry(addr).or_default();
        LoopbackTransport {
            local_addr: addr,
            network: self.clone(),
        }
    }
}

/// One endpoint on a [`LoopbackNetwork`]. Mirrors `UdpTransport`'s
/// interface so server/client code never branches on backend.
#[derive(Clone)]
pub struct LoopbackTransport {
    local_addr: SocketAddr,
    network: Arc<LoopbackNetwork>,
}

impl LoopbackTransport {
    /// Convenience for the common two-party case: a fresh network with
    /// exactly `addr_a` and `addr_b` registered.
    pub fn pair(addr_a: SocketAddr, addr_b: SocketAddr) -> (Self, Self) {
        let network = LoopbackNetwork::new();
        (network.endpoint(addr_a), network.endpoint(addr_b))
    }

    /// Registers a new address on this endpoint's network, e.g. to
    /// simulate a second client reaching the same server.
    pub fn new_peer(&self, addr: SocketAddr) -> LoopbackTransport {
        self.network.endpoint(addr)
    }
}

impl Transport for LoopbackTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn send_to(&self, addr: SocketAddr, bytes: &[u8]) -> NetResult<()> {
        if bytes.is_empty() {
            return Err(NetError::InvalidParam("payload empty".into()));
        }
        if bytes.len() > MTU {
            return Err(NetError::InvalidParam(format!(
                "payload {} bytes exceeds MTU {}",
                bytes.len(),
                MTU
            )));
        }
        let mut queues = self.network.queues.lock().expect("loopback queue poisoned");
        let queue = queues.entry(addr).or_default();
        if queue.len() >= LOOPBACK_QUEUE_DEPTH {
            return Err(NetError::Full);
        }
        queue.push_back(Datagram {
            from: self.local_addr,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    fn recv_all(&self) -> Vec<Datagram> {
        let mut queues = self.network.queues.lock().expect("loopback queue poisoned");
        queues
            .entry(self.local_addr)
            .or_default()
            .drain(..)
            .collect()
    }
}
