//! Group transport: one UDP socket joined to the multicast group, plus the receive loop.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use lanchat_core::MAX_DATAGRAM_LEN;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::interfaces::{self, JoinedVia};

/// Default group and port shared by every client.
pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(230, 0, 0, 1);
pub const DEFAULT_PORT: u16 = 5000;

const RECV_BUFFER_LEN: usize = 65536;
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Datagram endpoint on the chat group. Implemented by the real multicast socket and by test hubs.
#[async_trait]
pub trait GroupSocket: Send + Sync {
    /// Send one datagram to the group.
    async fn send(&self, payload: &[u8]) -> Result<usize, SendError>;

    /// Wait for the next datagram. Returns an error promptly once the socket is closed.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Close the endpoint and wake any pending `recv`.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("datagram of {len} bytes exceeds the {MAX_DATAGRAM_LEN}-byte UDP limit")]
    Oversized { len: usize },
    #[error("socket is closed")]
    Closed,
    #[error("send failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("socket setup failed: {0}")]
    Socket(#[from] io::Error),
    #[error("{0} is not an IPv4 multicast address")]
    InvalidGroup(Ipv4Addr),
    #[error("no interface could join multicast group {0}")]
    NoInterface(Ipv4Addr),
}

/// Reject payloads that cannot fit one UDP datagram.
pub fn check_payload(payload: &[u8]) -> Result<(), SendError> {
    if payload.len() > MAX_DATAGRAM_LEN {
        return Err(SendError::Oversized { len: payload.len() });
    }
    Ok(())
}

/// Close flag that wakes waiters.
#[derive(Debug)]
pub(crate) struct CloseSignal(watch::Sender<bool>);

impl CloseSignal {
    pub(crate) fn new() -> Self {
        CloseSignal(watch::channel(false).0)
    }

    /// Returns true on the first call.
    pub(crate) fn close(&self) -> bool {
        !self.0.send_replace(true)
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.0.borrow()
    }

    pub(crate) async fn closed(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "socket closed")
}

/// Multicast group membership on one UDP socket (used for both send and receive).
pub struct MulticastGroup {
    socket: UdpSocket,
    group: SocketAddrV4,
    joined: JoinedVia,
    close: CloseSignal,
}

impl MulticastGroup {
    /// Bind `0.0.0.0:port` and join `group` using the interface fallback chain.
    /// Must be called inside a Tokio runtime.
    pub fn open(group: Ipv4Addr, port: u16) -> Result<Self, NetworkError> {
        if !group.is_multicast() {
            return Err(NetworkError::InvalidGroup(group));
        }
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(1)?;

        let ifaces = interfaces::enumerate();
        let joined = interfaces::join_with_fallback(&ifaces, |local| {
            socket.join_multicast_v4(&group, &local)
        })
        .ok_or(NetworkError::NoInterface(group))?;

        if let JoinedVia::Interface(iface) = &joined {
            if let Some(local) = iface.ipv4.first() {
                if let Err(e) = socket.set_multicast_if_v4(local) {
                    debug!(interface = %iface.name, "could not pin outgoing interface: {}", e);
                }
            }
        }
        info!(%group, port, "joined multicast group ({})", joined);

        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket.into())?;
        Ok(Self {
            socket,
            group: SocketAddrV4::new(group, port),
            joined,
            close: CloseSignal::new(),
        })
    }

    /// How the group was joined.
    pub fn joined_via(&self) -> &JoinedVia {
        &self.joined
    }

    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }
}

#[async_trait]
impl GroupSocket for MulticastGroup {
    async fn send(&self, payload: &[u8]) -> Result<usize, SendError> {
        check_payload(payload)?;
        if self.close.is_closed() {
            return Err(SendError::Closed);
        }
        Ok(self.socket.send_to(payload, self.group).await?)
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.close.is_closed() {
            return Err(closed_error());
        }
        tokio::select! {
            _ = self.close.closed() => Err(closed_error()),
            r = self.socket.recv_from(buf) => r.map(|(n, _)| n),
        }
    }

    fn close(&self) {
        if self.close.close() {
            let local = match &self.joined {
                JoinedVia::Interface(i) => i.ipv4.first().copied().unwrap_or(Ipv4Addr::UNSPECIFIED),
                JoinedVia::DefaultRoute => Ipv4Addr::UNSPECIFIED,
            };
            if let Err(e) = self.socket.leave_multicast_v4(*self.group.ip(), local) {
                debug!("leave multicast group: {}", e);
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.close.is_closed()
    }
}

/// Feed every received datagram to `on_packet` until the socket is closed.
/// Timeouts and transient I/O errors never end the loop.
pub async fn receive_loop<S, F>(socket: &S, mut on_packet: F)
where
    S: GroupSocket + ?Sized,
    F: FnMut(&[u8]),
{
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    loop {
        match socket.recv(&mut buf).await {
            Ok(n) => on_packet(&buf[..n]),
            Err(_) if socket.is_closed() => break,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(e) => {
                warn!("receive error: {}", e);
                tokio::time::sleep(RECV_ERROR_BACKOFF).await;
            }
        }
    }
    debug!("receive loop stopped");
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryHub;
    use super::*;
    use std::sync::Arc;

    #[test]
    fn payload_limit() {
        assert!(check_payload(&vec![0u8; MAX_DATAGRAM_LEN]).is_ok());
        assert!(matches!(
            check_payload(&vec![0u8; MAX_DATAGRAM_LEN + 1]),
            Err(SendError::Oversized { len }) if len == MAX_DATAGRAM_LEN + 1
        ));
    }

    #[tokio::test]
    async fn open_rejects_unicast_group() {
        let r = MulticastGroup::open(Ipv4Addr::new(192, 168, 1, 1), 0);
        assert!(matches!(r, Err(NetworkError::InvalidGroup(_))));
    }

    #[tokio::test]
    async fn oversized_never_reaches_the_group() {
        let hub = MemoryHub::new();
        let a = hub.member();
        let b = hub.member();
        let err = a.send(&vec![b'x'; 70_000]).await.unwrap_err();
        assert!(matches!(err, SendError::Oversized { len: 70_000 }));

        a.send(b"small").await.unwrap();
        let mut buf = [0u8; 64];
        let n = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"small");
    }

    #[tokio::test]
    async fn close_unblocks_pending_receive_loop() {
        let hub = MemoryHub::new();
        let sock = Arc::new(hub.member());
        let loop_sock = sock.clone();
        let task = tokio::spawn(async move {
            let mut seen = Vec::new();
            receive_loop(loop_sock.as_ref(), |p| seen.push(p.to_vec())).await;
            seen
        });
        hub.inject(b"one");
        tokio::time::sleep(Duration::from_millis(20)).await;
        sock.close();
        let seen = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("loop did not stop after close")
            .unwrap();
        assert_eq!(seen, vec![b"one".to_vec()]);
        assert!(matches!(sock.send(b"late").await, Err(SendError::Closed)));
    }

    /// Replays a fixed sequence of receive results, then waits for close.
    struct Scripted {
        script: parking_lot::Mutex<std::collections::VecDeque<io::Result<Vec<u8>>>>,
        close: CloseSignal,
    }

    #[async_trait]
    impl GroupSocket for Scripted {
        async fn send(&self, payload: &[u8]) -> Result<usize, SendError> {
            Ok(payload.len())
        }

        async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            let next = self.script.lock().pop_front();
            match next {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(Err(e)) => Err(e),
                None => {
                    self.close.closed().await;
                    Err(closed_error())
                }
            }
        }

        fn close(&self) {
            self.close.close();
        }

        fn is_closed(&self) -> bool {
            self.close.is_closed()
        }
    }

    #[tokio::test]
    async fn io_errors_do_not_stop_the_loop() {
        let script = vec![
            Err(io::Error::from(io::ErrorKind::TimedOut)),
            Err(io::Error::from(io::ErrorKind::WouldBlock)),
            Err(io::Error::new(io::ErrorKind::Other, "network down")),
            Ok(b"one".to_vec()),
            Err(io::Error::from(io::ErrorKind::Interrupted)),
            Err(io::Error::from(io::ErrorKind::ConnectionReset)),
            Ok(b"two".to_vec()),
        ];
        let sock = Arc::new(Scripted {
            script: parking_lot::Mutex::new(script.into_iter().collect()),
            close: CloseSignal::new(),
        });
        let loop_sock = sock.clone();
        let task = tokio::spawn(async move {
            let mut seen = Vec::new();
            receive_loop(loop_sock.as_ref(), |p| seen.push(p.to_vec())).await;
            seen
        });
        // Two backoffs of RECV_ERROR_BACKOFF each, with margin.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!task.is_finished());
        sock.close();
        let seen = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("loop did not stop after close")
            .unwrap();
        assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn malformed_packets_do_not_stop_the_loop() {
        let hub = MemoryHub::new();
        let sock = Arc::new(hub.member());
        let loop_sock = sock.clone();
        let task = tokio::spawn(async move {
            let mut count = 0usize;
            receive_loop(loop_sock.as_ref(), |_| count += 1).await;
            count
        });
        hub.inject(&[0xff, 0xfe]);
        hub.inject(b"");
        hub.inject(b"still here");
        tokio::time::sleep(Duration::from_millis(20)).await;
        sock.close();
        assert_eq!(task.await.unwrap(), 3);
    }
}
