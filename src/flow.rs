use chrono::{DateTime, Duration, Utc};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;
use std::net::{Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl TransportProtocol {
    pub fn protocol_number(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
        }
    }
}

/// Bidirectional flow key. Keys are canonicalized on construction: the
/// smaller (address, port) endpoint is always stored as the source, so both
/// directions of a connection map to the same key and equality/hashing can be
/// derived structurally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey<A> {
    pub transport: TransportProtocol,
    pub src_addr: A,
    pub dst_addr: A,
    pub src_port: u16,
    pub dst_port: u16,
}

impl<A: Copy + Ord> FlowKey<A> {
    pub fn new(
        transport: TransportProtocol,
        src_addr: A,
        src_port: u16,
        dst_addr: A,
        dst_port: u16,
    ) -> Self {
        let mut key = Self {
            transport,
            src_addr,
            dst_addr,
            src_port,
            dst_port,
        };

        if (key.dst_addr, key.dst_port) < (key.src_addr, key.src_port) {
            std::mem::swap(&mut key.src_addr, &mut key.dst_addr);
            std::mem::swap(&mut key.src_port, &mut key.dst_port);
        }

        key
    }
}

#[derive(Debug, Clone)]
pub struct FlowInfo {
    pub first_packet: DateTime<Utc>,
    pub last_packet: DateTime<Utc>,
    pub total_bytes: u64,
    pub total_packets: u64,
}

/// One map per network protocol keeps the keys fixed-size and the lookup
/// path monomorphic.
pub struct FlowTable {
    pub v4: HashMap<FlowKey<Ipv4Addr>, FlowInfo>,
    pub v6: HashMap<FlowKey<Ipv6Addr>, FlowInfo>,
    export_timeout: Duration,
    max_flow_lifetime: Duration,
}

impl FlowTable {
    pub fn new(export_timeout: Duration, max_flow_lifetime: Duration) -> Self {
        Self {
            v4: HashMap::new(),
            v6: HashMap::new(),
            export_timeout,
            max_flow_lifetime,
        }
    }

    pub fn observe_v4(
        &mut self,
        key: FlowKey<Ipv4Addr>,
        admit_new: bool,
        wire_len: u64,
        now: DateTime<Utc>,
    ) -> bool {
        observe(&mut self.v4, key, admit_new, wire_len, now)
    }

    pub fn observe_v6(
        &mut self,
        key: FlowKey<Ipv6Addr>,
        admit_new: bool,
        wire_len: u64,
        now: DateTime<Utc>,
    ) -> bool {
        observe(&mut self.v6, key, admit_new, wire_len, now)
    }

    /// Drops entries past the export or lifetime deadline, invokes `emit` for
    /// every remaining entry. Entries that have expired are not emitted.
    pub fn sweep_v4(&mut self, now: DateTime<Utc>, emit: impl FnMut(&FlowKey<Ipv4Addr>, &FlowInfo)) {
        sweep(&mut self.v4, now, self.export_timeout, self.max_flow_lifetime, emit)
    }

    pub fn sweep_v6(&mut self, now: DateTime<Utc>, emit: impl FnMut(&FlowKey<Ipv6Addr>, &FlowInfo)) {
        sweep(&mut self.v6, now, self.export_timeout, self.max_flow_lifetime, emit)
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}

fn observe<A: Copy + Eq + Hash>(
    map: &mut HashMap<FlowKey<A>, FlowInfo>,
    key: FlowKey<A>,
    admit_new: bool,
    wire_len: u64,
    now: DateTime<Utc>,
) -> bool {
    let info = match map.entry(key) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => {
            if !admit_new {
                return false;
            }
            entry.insert(FlowInfo {
                first_packet: now,
                last_packet: now,
                total_bytes: 0,
                total_packets: 0,
            })
        }
    };

    info.last_packet = now;
    info.total_bytes += wire_len;
    info.total_packets += 1;
    true
}

fn sweep<A: Copy + Eq + Hash>(
    map: &mut HashMap<FlowKey<A>, FlowInfo>,
    now: DateTime<Utc>,
    export_timeout: Duration,
    max_flow_lifetime: Duration,
    mut emit: impl FnMut(&FlowKey<A>, &FlowInfo),
) {
    map.retain(|key, info| {
        if now - info.last_packet > export_timeout || now - info.first_packet > max_flow_lifetime {
            return false;
        }
        emit(key, info);
        true
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn table() -> FlowTable {
        FlowTable::new(Duration::seconds(30), Duration::seconds(300))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_600_000_000 + secs, 0).unwrap()
    }

    fn udp_key(a: [u8; 4], ap: u16, b: [u8; 4], bp: u16) -> FlowKey<Ipv4Addr> {
        FlowKey::new(
            TransportProtocol::Udp,
            Ipv4Addr::from(a),
            ap,
            Ipv4Addr::from(b),
            bp,
        )
    }

    #[test]
    fn both_directions_collapse_to_one_entry() {
        let mut table = table();

        let fwd = udp_key([10, 0, 0, 1], 5000, [10, 0, 0, 2], 53);
        let rev = udp_key([10, 0, 0, 2], 53, [10, 0, 0, 1], 5000);
        assert_eq!(fwd, rev);

        assert!(table.observe_v4(fwd, true, 100, at(0)));
        assert!(table.observe_v4(rev, true, 120, at(1)));

        assert_eq!(table.v4.len(), 1);
        let info = table.v4.values().next().unwrap();
        assert_eq!(info.total_bytes, 220);
        assert_eq!(info.total_packets, 2);
        assert!(info.last_packet >= info.first_packet);
    }

    #[test]
    fn tcp_without_opening_segment_is_not_admitted() {
        let mut table = table();
        let key = FlowKey::new(
            TransportProtocol::Tcp,
            Ipv4Addr::new(10, 0, 0, 1),
            40000,
            Ipv4Addr::new(10, 0, 0, 2),
            80,
        );

        // ACK-only segment for an unknown flow.
        assert!(!table.observe_v4(key, false, 60, at(0)));
        assert!(table.v4.is_empty());

        // Opening SYN creates the entry.
        assert!(table.observe_v4(key, true, 60, at(1)));
        assert_eq!(table.v4.len(), 1);
        assert_eq!(table.v4[&key].total_bytes, 60);

        // Reverse SYN+ACK updates the same entry even though it would not be
        // admitted on its own.
        let rev = FlowKey::new(
            TransportProtocol::Tcp,
            Ipv4Addr::new(10, 0, 0, 2),
            80,
            Ipv4Addr::new(10, 0, 0, 1),
            40000,
        );
        assert!(table.observe_v4(rev, false, 60, at(2)));
        assert_eq!(table.v4.len(), 1);
        assert_eq!(table.v4[&key].total_bytes, 120);
    }

    #[test]
    fn byte_counter_is_monotonic() {
        let mut table = table();
        let key = udp_key([10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000);

        let mut previous = 0;
        for i in 0..16 {
            table.observe_v4(key, true, 10 + i, at(i as i64));
            let bytes = table.v4[&key].total_bytes;
            assert!(bytes >= previous);
            previous = bytes;
        }
    }

    #[test]
    fn transport_protocols_do_not_share_entries() {
        let mut table = table();
        let udp = udp_key([10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000);
        let tcp = FlowKey::new(
            TransportProtocol::Tcp,
            Ipv4Addr::new(10, 0, 0, 1),
            1000,
            Ipv4Addr::new(10, 0, 0, 2),
            2000,
        );

        table.observe_v4(udp, true, 100, at(0));
        table.observe_v4(tcp, true, 100, at(0));
        assert_eq!(table.v4.len(), 2);
    }

    #[test]
    fn sweep_keeps_emitting_until_export_timeout() {
        let mut table = table();
        let key = udp_key([10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000);
        table.observe_v4(key, true, 100, at(10));

        // Still exported at every pass while within the 30s idle timeout.
        for t in [15, 20, 25, 30, 35, 40] {
            let mut emitted = 0;
            table.sweep_v4(at(t), |_, _| emitted += 1);
            assert_eq!(emitted, 1, "expected emission at t={}", t);
        }

        // Past the timeout the entry is removed without a final emission.
        let mut emitted = 0;
        table.sweep_v4(at(45), |_, _| emitted += 1);
        assert_eq!(emitted, 0);
        assert!(table.v4.is_empty());
    }

    #[test]
    fn sweep_drops_flows_past_max_lifetime() {
        let mut table = table();
        let key = udp_key([10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000);
        table.observe_v4(key, true, 100, at(0));

        // Keep the flow active so only the lifetime bound can expire it.
        for t in (0..=310).step_by(5) {
            table.observe_v4(key, true, 100, at(t));
        }

        let mut emitted = 0;
        table.sweep_v4(at(315), |_, _| emitted += 1);
        assert_eq!(emitted, 0);
        assert!(table.v4.is_empty());
    }
}
