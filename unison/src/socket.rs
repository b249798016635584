use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket as StdUdpSocket};

use derive_more::Display;
use socket2::{Domain, Type};
use structopt::StructOpt;
use thiserror::Error;
use tokio::net::UdpSocket;

use unison_protocol::message::{DecodeError, Message};
use unison_protocol::time::WallMs;

/// DSCP expedited-forwarding, shifted into the TOS byte. Switches that
/// honor it move sync datagrams ahead of bulk traffic.
const TOS_EXPEDITED_FORWARDING: u32 = 46 << 2;

const MAX_DATAGRAM_SIZE: usize = 16 * 1024;

/// Unknown or malformed datagrams are logged at most this often.
const WARN_INTERVAL_MS: i64 = 2_000;

#[derive(Debug, Error)]
pub enum ListenError {
    #[error("creating socket: {0}")]
    Create(io::Error),
    #[error("setting {option}: {source}")]
    SetOption {
        option: &'static str,
        source: io::Error,
    },
    #[error("binding {0}: {1}")]
    Bind(SocketAddrV4, io::Error),
    #[error("joining group {0}: {1}")]
    JoinGroup(Ipv4Addr, io::Error),
    #[error("registering socket with runtime: {0}")]
    Register(io::Error),
}

#[derive(StructOpt, Debug, Clone)]
pub struct SocketOpt {
    /// Multicast group address including port, eg. 239.100.100.100:4700
    #[structopt(
        long,
        name = "addr",
        env = "UNISON_MULTICAST",
        default_value = "239.100.100.100:4700"
    )]
    pub multicast: SocketAddrV4,
}

/// The room's transport endpoint: a unicast tx socket (also the reply
/// address peers see) and a multicast rx socket for group traffic.
pub struct Socket {
    multicast: SocketAddrV4,
    tx: UdpSocket,
    rx: UdpSocket,
}

#[derive(Clone, Copy, Debug, Display, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PeerAddr(SocketAddr);

impl Socket {
    pub fn open(opt: SocketOpt) -> Result<Socket, ListenError> {
        let group = *opt.multicast.ip();
        let port = opt.multicast.port();

        let tx = group_socket(group, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
        let rx = group_socket(group, SocketAddrV4::new(group, port))?;

        Ok(Socket {
            multicast: SocketAddrV4::new(group, port),
            tx,
            rx,
        })
    }

    pub async fn broadcast(&self, msg: &[u8]) -> Result<(), io::Error> {
        self.tx.send_to(msg, self.multicast).await?;
        Ok(())
    }

    pub async fn send_to(&self, msg: &[u8], dest: PeerAddr) -> Result<(), io::Error> {
        self.tx.send_to(msg, dest.0).await?;
        Ok(())
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, PeerAddr), io::Error> {
        loop {
            let socket = tokio::select! {
                ready = self.tx.readable() => { ready?; &self.tx }
                ready = self.rx.readable() => { ready?; &self.rx }
            };

            match socket.try_recv_from(buf) {
                Ok((nbytes, addr)) => return Ok((nbytes, PeerAddr(addr))),
                // readiness can be spurious, go back to waiting
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// One group-joined UDP socket, bound to `bind`, ready for the tokio
/// reactor. Both halves of [`Socket`] come from here; only the bind
/// address differs.
fn group_socket(group: Ipv4Addr, bind: SocketAddrV4) -> Result<UdpSocket, ListenError> {
    let set = |option: &'static str, result: io::Result<()>| {
        result.map_err(|source| ListenError::SetOption { option, source })
    };

    let socket =
        socket2::Socket::new(Domain::IPV4, Type::DGRAM, None).map_err(ListenError::Create)?;

    // several unison processes on one machine share the group port
    set("SO_REUSEADDR", socket.set_reuse_address(true))?;
    set("SO_BROADCAST", socket.set_broadcast(true))?;

    // losing the priority marking is not fatal
    if let Err(e) = socket.set_tos(TOS_EXPEDITED_FORWARDING) {
        log::debug!("could not mark traffic expedited-forwarding: {e}");
    }

    socket
        .bind(&bind.into())
        .map_err(|e| ListenError::Bind(bind, e))?;
    socket
        .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
        .map_err(|e| ListenError::JoinGroup(group, e))?;
    let _ = socket.set_multicast_loop_v4(true);

    let socket: StdUdpSocket = socket.into();
    set("O_NONBLOCK", socket.set_nonblocking(true))?;
    UdpSocket::from_std(socket).map_err(ListenError::Register)
}

/// Message-level wrapper: encodes/decodes the JSON wire format and
/// keeps unknown-type chatter out of the logs.
pub struct ProtocolSocket {
    socket: Socket,
    warn_limiter: std::cell::Cell<Option<WallMs>>,
}

impl ProtocolSocket {
    pub fn new(socket: Socket) -> Self {
        ProtocolSocket {
            socket,
            warn_limiter: std::cell::Cell::new(None),
        }
    }

    pub async fn broadcast(&self, message: &Message) -> Result<(), io::Error> {
        let bytes = encode(message)?;
        self.socket.broadcast(&bytes).await
    }

    pub async fn send_to(&self, message: &Message, peer: PeerAddr) -> Result<(), io::Error> {
        let bytes = encode(message)?;
        self.socket.send_to(&bytes, peer).await
    }

    /// Receive the next decodable message, skipping datagrams that are
    /// not for us with a rate-limited warning.
    pub async fn recv_from(&self, now: impl Fn() -> WallMs) -> Result<(Message, PeerAddr), io::Error> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let (nbytes, peer) = self.socket.recv_from(&mut buf).await?;

            match Message::decode(&buf[..nbytes]) {
                Ok(message) => return Ok((message, peer)),
                Err(e) => self.warn_decode(&e, peer, now()),
            }
        }
    }

    fn warn_decode(&self, error: &DecodeError, peer: PeerAddr, now: WallMs) {
        if let Some(last) = self.warn_limiter.get() {
            if now.millis_since(last) < WARN_INTERVAL_MS {
                return;
            }
        }
        self.warn_limiter.set(Some(now));
        log::warn!("ignoring message from {peer}: {error}");
    }
}

fn encode(message: &Message) -> Result<Vec<u8>, io::Error> {
    message
        .encode()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
