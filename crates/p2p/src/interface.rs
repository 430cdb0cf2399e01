//! Contract exposed by the external gossip overlay.

use std::net::IpAddr;

/// Opaque session cursor for peer enumeration.
pub type PeerSession = u64;

/// The overlay the node plugs into.  The production implementation lives
/// outside this repository; tests use [`MemP2p`].
pub trait P2pInterface: Send + Sync {
    /// Hands a payload to the overlay.  `broadcast` floods; otherwise the
    /// overlay picks a subset of peers.
    fn propagate_message(&self, bytes: &[u8], broadcast: bool) -> bool;

    /// Fills `out` with up to `count` peer addresses, resuming from
    /// `session`.  Returns the next session cursor.
    fn get_peers(&self, session: PeerSession, out: &mut Vec<IpAddr>, count: usize) -> PeerSession;

    fn add_to_blacklist(&self, ip: IpAddr);

    fn is_blacklisted(&self, ip: IpAddr) -> bool;
}

/// Loopback overlay used in tests: propagated payloads are captured, peers
/// are a fixed list.
#[derive(Default)]
pub struct MemP2p {
    pub peers: Vec<IpAddr>,
    pub sent: parking_lot::Mutex<Vec<Vec<u8>>>,
    blacklist: parking_lot::Mutex<Vec<IpAddr>>,
}

impl P2pInterface for MemP2p {
    fn propagate_message(&self, bytes: &[u8], _broadcast: bool) -> bool {
        self.sent.lock().push(bytes.to_vec());
        true
    }

    fn get_peers(&self, session: PeerSession, out: &mut Vec<IpAddr>, count: usize) -> PeerSession {
        let start = session as usize;
        for ip in self.peers.iter().skip(start).take(count) {
            out.push(*ip);
        }
        (start + count).min(self.peers.len()) as PeerSession
    }

    fn add_to_blacklist(&self, ip: IpAddr) {
        self.blacklist.lock().push(ip);
    }

    fn is_blacklisted(&self, ip: IpAddr) -> bool {
        self.blacklist.lock().contains(&ip)
    }
}
