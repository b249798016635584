use std::io;
use std::net::IpAddr;

use unison_protocol::types::RoomId;

/// A room visible on the local network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredRoom {
    pub room_id: RoomId,
    pub room_name: String,
    pub host_ip: IpAddr,
    pub ws_port: u16,
    pub http_port: u16,
    pub app_version: String,
    pub codec: Option<String>,
}

/// Peer discovery collaborator (mDNS in practice). The sync engine only
/// depends on this seam; the multicast transport works without it.
pub trait Discovery: Send {
    fn publish(&mut self, room: &DiscoveredRoom) -> io::Result<()>;
    fn unpublish(&mut self) -> io::Result<()>;
    /// Drain the next discovered room, if any arrived since last poll.
    fn poll(&mut self) -> Option<DiscoveredRoom>;
}

/// Discovery disabled: rooms are joined by multicast group directly.
pub struct NoDiscovery;

impl Discovery for NoDiscovery {
    fn publish(&mut self, room: &DiscoveredRoom) -> io::Result<()> {
        log::debug!("discovery disabled, not publishing {}", room.room_id);
        Ok(())
    }

    fn unpublish(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn poll(&mut self) -> Option<DiscoveredRoom> {
        None
    }
}
