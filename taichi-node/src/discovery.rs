//! LAN discovery: UDP multicast beacon, parse beacons from other nodes and
//! hand sightings to the membership loop.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use taichi_core::{format_endpoint, Beacon, PeerId};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 56, 70);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sighting {
    Seen { peer: PeerId, endpoint: String },
    Departed(PeerId),
}

/// Map one received beacon to a sighting. Our own beacons and foreign
/// protocol versions yield nothing.
pub fn interpret(me: &PeerId, bytes: &[u8], from: SocketAddr) -> Option<Sighting> {
    let beacon = match Beacon::decode(bytes) {
        Ok(b) => b,
        Err(e) => {
            trace!(%from, error = %e, "ignoring datagram");
            return None;
        }
    };
    if beacon.peer_id == *me {
        return None;
    }
    if beacon.is_departure() {
        return Some(Sighting::Departed(beacon.peer_id));
    }
    Some(Sighting::Seen {
        peer: beacon.peer_id,
        endpoint: format_endpoint(SocketAddr::new(from.ip(), beacon.mailbox_port)),
    })
}

/// Address other nodes can reach us on. Falls back to loopback when there
/// is no route.
pub fn local_ip() -> IpAddr {
    std::net::UdpSocket::bind(("0.0.0.0", 0))
        .and_then(|s| {
            s.connect((MULTICAST_GROUP, 9))?;
            s.local_addr()
        })
        .map(|a| a.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn make_multicast_socket(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Beacon every `interval`, report sightings, and announce departure on
/// cancellation.
pub async fn run_discovery(
    me: PeerId,
    beacon_port: u16,
    mailbox_port: u16,
    interval: Duration,
    sightings: mpsc::Sender<Sighting>,
    cancel: CancellationToken,
) -> io::Result<()> {
    let socket = make_multicast_socket(beacon_port)?;
    let dest = SocketAddr::V4(SocketAddrV4::new(MULTICAST_GROUP, beacon_port));
    let hello = Beacon::new(me, mailbox_port)
        .encode()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    info!(port = beacon_port, "discovery started");

    let mut ticker = tokio::time::interval(interval);
    let mut buf = vec![0u8; 1500];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&hello, dest).await {
                    debug!(error = %e, "beacon send failed");
                }
            }
            recv = socket.recv_from(&mut buf) => {
                let (n, from) = recv?;
                if let Some(s) = interpret(&me, &buf[..n], from) {
                    if sightings.send(s).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    let bye = Beacon::departure(me)
        .encode()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    socket.send_to(&bye, dest).await?;
    debug!("departure announced");
    Ok(())
}
