use super::parser::{MessageBody, OlsrMessage};
use super::AddressFamily;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::IpAddr;

#[derive(Debug, Clone)]
pub struct NeighborEntry {
    pub addr: IpAddr,
    pub lq: u8,
    pub nlq: u8,
    pub valid_until: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TopologyEntry {
    pub dest: IpAddr,
    pub lq: u8,
    pub nlq: u8,
    pub valid_until: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TopologySet {
    pub ansn: u16,
    pub entries: Vec<TopologyEntry>,
}

#[derive(Debug, Clone)]
pub struct MidEntry {
    pub alias: IpAddr,
    pub valid_until: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct HnaEntry {
    pub network: IpAddr,
    pub prefix_len: u8,
    pub valid_until: DateTime<Utc>,
}

/// Per-originator routing state. All addresses in a node's sets share the
/// originator's family; payload addresses of the other family are discarded
/// on application.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub family: AddressFamily,
    pub neighbors: Vec<NeighborEntry>,
    pub topology: Option<TopologySet>,
    pub mid: Vec<MidEntry>,
    pub hna: Vec<HnaEntry>,
}

impl NodeEntry {
    fn new(family: AddressFamily) -> Self {
        Self {
            family,
            neighbors: Vec::new(),
            topology: None,
            mid: Vec::new(),
            hna: Vec::new(),
        }
    }
}

/// Wraparound-aware 16 bit sequence number comparison: `s1` is newer than
/// `s2` iff they differ and (s1 - s2) mod 2^16 < 2^15.
pub fn seqno_newer(s1: u16, s2: u16) -> bool {
    s1 != s2 && s1.wrapping_sub(s2) < 0x8000
}

fn family_of(addr: IpAddr) -> AddressFamily {
    match addr {
        IpAddr::V4(_) => AddressFamily::Ipv4,
        IpAddr::V6(_) => AddressFamily::Ipv6,
    }
}

#[derive(Default)]
pub struct NodeStore {
    nodes: HashMap<IpAddr, NodeEntry>,
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&IpAddr, &NodeEntry)> {
        self.nodes.iter()
    }

    pub fn get(&self, originator: &IpAddr) -> Option<&NodeEntry> {
        self.nodes.get(originator)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Merges one decoded OLSR message into the store. Two updates for the
    /// same originator always land in the same node entry.
    pub fn apply(&mut self, message: &OlsrMessage, now: DateTime<Utc>) {
        let family = family_of(message.originator);
        let valid_until = now + message.vtime;

        let node = self
            .nodes
            .entry(message.originator)
            .or_insert_with(|| NodeEntry::new(family));

        match &message.body {
            MessageBody::Hello { neighbors } => {
                for neighbor in neighbors {
                    if family_of(neighbor.addr) != family {
                        tracing::warn!(
                            "dropping neighbor {} with mismatched address family",
                            neighbor.addr
                        );
                        continue;
                    }
                    match node.neighbors.iter().position(|e| e.addr == neighbor.addr) {
                        Some(i) => {
                            let entry = &mut node.neighbors[i];
                            entry.lq = neighbor.lq;
                            entry.nlq = neighbor.nlq;
                            entry.valid_until = valid_until;
                        }
                        None => node.neighbors.push(NeighborEntry {
                            addr: neighbor.addr,
                            lq: neighbor.lq,
                            nlq: neighbor.nlq,
                            valid_until,
                        }),
                    }
                }
            }
            MessageBody::Tc { ansn, neighbors } => {
                if let Some(stored) = &node.topology {
                    if !seqno_newer(*ansn, stored.ansn) {
                        tracing::trace!(
                            "dropping stale TC from {} (ansn {} vs stored {})",
                            message.originator,
                            ansn,
                            stored.ansn
                        );
                        return;
                    }
                }

                let entries = neighbors
                    .iter()
                    .filter(|n| family_of(n.addr) == family)
                    .map(|n| TopologyEntry {
                        dest: n.addr,
                        lq: n.lq,
                        nlq: n.nlq,
                        valid_until,
                    })
                    .collect();
                node.topology = Some(TopologySet {
                    ansn: *ansn,
                    entries,
                });
            }
            MessageBody::Mid { aliases } => {
                for alias in aliases {
                    if family_of(*alias) != family {
                        continue;
                    }
                    match node.mid.iter().position(|e| e.alias == *alias) {
                        Some(i) => node.mid[i].valid_until = valid_until,
                        None => node.mid.push(MidEntry {
                            alias: *alias,
                            valid_until,
                        }),
                    }
                }
            }
            MessageBody::Hna { networks } => {
                for (network, prefix_len) in networks {
                    if family_of(*network) != family {
                        continue;
                    }
                    let found = node
                        .hna
                        .iter()
                        .position(|e| e.network == *network && e.prefix_len == *prefix_len);
                    match found {
                        Some(i) => node.hna[i].valid_until = valid_until,
                        None => node.hna.push(HnaEntry {
                            network: *network,
                            prefix_len: *prefix_len,
                            valid_until,
                        }),
                    }
                }
            }
            MessageBody::Other(message_type) => {
                tracing::trace!("ignoring OLSR message type {}", message_type);
            }
        }
    }

    /// Removes every set entry whose validity time has passed. Runs ahead of
    /// each topology export so the emitter only sees live entries.
    pub fn expire(&mut self, now: DateTime<Utc>) {
        for node in self.nodes.values_mut() {
            node.neighbors.retain(|e| e.valid_until > now);
            node.mid.retain(|e| e.valid_until > now);
            node.hna.retain(|e| e.valid_until > now);
            if let Some(topology) = &mut node.topology {
                topology.entries.retain(|e| e.valid_until > now);
            }
        }
    }
}
