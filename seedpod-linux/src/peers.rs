//! Static peer list from config. Peer ids are derived from the address so they stay stable
//! across restarts.

use std::net::SocketAddr;

use seedpod_core::{KnownPeer, PackageId, PeerId, PeerInfo, PeerRegistry};
use sha2::{Digest, Sha256};

use crate::config::PeerEntry;

pub struct StaticPeers {
    peers: Vec<KnownPeer>,
}

/// First 16 bytes of SHA-256 over the address text.
pub fn peer_id_for(addr: &SocketAddr) -> PeerId {
    let digest = Sha256::digest(addr.to_string().as_bytes());
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest[..16]);
    PeerId::from_bytes(id)
}

impl StaticPeers {
    pub fn from_config(entries: &[PeerEntry]) -> Self {
        let mut peers: Vec<KnownPeer> = Vec::with_capacity(entries.len());
        for entry in entries {
            let id = peer_id_for(&entry.addr);
            if peers.iter().any(|p| p.info.id == id) {
                tracing::warn!(addr = %entry.addr, "duplicate peer entry ignored");
                continue;
            }
            let packages = entry.packages.as_ref().map(|list| {
                list.iter()
                    .filter_map(|hex| match hex.parse::<PackageId>() {
                        Ok(id) => Some(id),
                        Err(_) => {
                            tracing::warn!(addr = %entry.addr, package = %hex, "bad package id in peer entry");
                            None
                        }
                    })
                    .collect()
            });
            peers.push(KnownPeer {
                info: PeerInfo {
                    id,
                    endpoint: entry.addr,
                },
                packages,
            });
        }
        Self { peers }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl PeerRegistry for StaticPeers {
    fn peers(&self) -> Vec<KnownPeer> {
        self.peers.clone()
    }
}
