use crate::capture::CaptureHandle;
use crate::flow::{FlowInfo, FlowKey, FlowTable};
use crate::ipfix::{Exporter, FieldSpec, Template};
use crate::olsr::state::{NodeEntry, NodeStore};
use crate::olsr::AddressFamily;
use chrono::{DateTime, Utc};
use std::net::IpAddr;

// IANA information elements (assigned numbers, enterprise bit clear).
const IE_OCTET_DELTA_COUNT: u16 = 1;
const IE_PACKET_DELTA_COUNT: u16 = 2;
const IE_PROTOCOL_IDENTIFIER: u16 = 4;
const IE_SOURCE_TRANSPORT_PORT: u16 = 7;
const IE_SOURCE_IPV4_ADDRESS: u16 = 8;
const IE_INGRESS_INTERFACE: u16 = 10;
const IE_DESTINATION_TRANSPORT_PORT: u16 = 11;
const IE_DESTINATION_IPV4_ADDRESS: u16 = 12;
const IE_SOURCE_IPV6_ADDRESS: u16 = 27;
const IE_DESTINATION_IPV6_ADDRESS: u16 = 28;
const IE_PACKET_TOTAL_COUNT: u16 = 86;
const IE_DROPPED_PACKET_TOTAL_COUNT: u16 = 135;
const IE_FLOW_START_SECONDS: u16 = 150;
const IE_FLOW_END_SECONDS: u16 = 151;

/// Private enterprise number carrying the OLSR-specific elements.
pub const OLSR_ENTERPRISE_ID: u32 = 8889;

const IE_OLSR_ORIGINATOR: u16 = 1;
const IE_OLSR_NEIGHBOR: u16 = 2;
const IE_OLSR_LINK_QUALITY: u16 = 3;
const IE_OLSR_NEIGHBOR_LINK_QUALITY: u16 = 4;
const IE_OLSR_ANSN: u16 = 5;
const IE_OLSR_TOPOLOGY_DESTINATION: u16 = 6;
const IE_OLSR_MID_ALIAS: u16 = 7;
const IE_OLSR_HNA_NETWORK: u16 = 8;
const IE_OLSR_HNA_PREFIX_LENGTH: u16 = 9;
const IE_OLSR_VALID_UNTIL: u16 = 10;
const IE_OLSR_IF_DROPPED: u16 = 11;

pub const TEMPLATE_FLOW_V4: u16 = 256;
pub const TEMPLATE_FLOW_V6: u16 = 257;
pub const TEMPLATE_NEIGHBOR_V4: u16 = 258;
pub const TEMPLATE_NEIGHBOR_V6: u16 = 259;
pub const TEMPLATE_TOPOLOGY_V4: u16 = 260;
pub const TEMPLATE_TOPOLOGY_V6: u16 = 261;
pub const TEMPLATE_MID_V4: u16 = 262;
pub const TEMPLATE_MID_V6: u16 = 263;
pub const TEMPLATE_HNA_V4: u16 = 264;
pub const TEMPLATE_HNA_V6: u16 = 265;
pub const TEMPLATE_CAPTURE_STATS: u16 = 266;

fn addr_len(family: AddressFamily) -> u16 {
    family.addr_len() as u16
}

fn originator_field(family: AddressFamily) -> FieldSpec {
    FieldSpec::vendor(IE_OLSR_ORIGINATOR, addr_len(family), OLSR_ENTERPRISE_ID)
}

fn flow_template(family: AddressFamily) -> Template {
    let (id, src, dst) = match family {
        AddressFamily::Ipv4 => (
            TEMPLATE_FLOW_V4,
            FieldSpec::iana(IE_SOURCE_IPV4_ADDRESS, 4),
            FieldSpec::iana(IE_DESTINATION_IPV4_ADDRESS, 4),
        ),
        AddressFamily::Ipv6 => (
            TEMPLATE_FLOW_V6,
            FieldSpec::iana(IE_SOURCE_IPV6_ADDRESS, 16),
            FieldSpec::iana(IE_DESTINATION_IPV6_ADDRESS, 16),
        ),
    };

    Template::new(
        id,
        vec![
            src,
            dst,
            FieldSpec::iana(IE_SOURCE_TRANSPORT_PORT, 2),
            FieldSpec::iana(IE_DESTINATION_TRANSPORT_PORT, 2),
            FieldSpec::iana(IE_PROTOCOL_IDENTIFIER, 1),
            FieldSpec::iana(IE_OCTET_DELTA_COUNT, 8),
            FieldSpec::iana(IE_PACKET_DELTA_COUNT, 8),
            FieldSpec::iana(IE_FLOW_START_SECONDS, 4),
            FieldSpec::iana(IE_FLOW_END_SECONDS, 4),
        ],
    )
}

fn neighbor_template(family: AddressFamily, id: u16) -> Template {
    Template::new(
        id,
        vec![
            originator_field(family),
            FieldSpec::vendor(IE_OLSR_NEIGHBOR, addr_len(family), OLSR_ENTERPRISE_ID),
            FieldSpec::vendor(IE_OLSR_LINK_QUALITY, 1, OLSR_ENTERPRISE_ID),
            FieldSpec::vendor(IE_OLSR_NEIGHBOR_LINK_QUALITY, 1, OLSR_ENTERPRISE_ID),
            FieldSpec::vendor(IE_OLSR_VALID_UNTIL, 4, OLSR_ENTERPRISE_ID),
        ],
    )
}

fn topology_template(family: AddressFamily, id: u16) -> Template {
    Template::new(
        id,
        vec![
            originator_field(family),
            FieldSpec::vendor(
                IE_OLSR_TOPOLOGY_DESTINATION,
                addr_len(family),
                OLSR_ENTERPRISE_ID,
            ),
            FieldSpec::vendor(IE_OLSR_LINK_QUALITY, 1, OLSR_ENTERPRISE_ID),
            FieldSpec::vendor(IE_OLSR_NEIGHBOR_LINK_QUALITY, 1, OLSR_ENTERPRISE_ID),
            FieldSpec::vendor(IE_OLSR_ANSN, 2, OLSR_ENTERPRISE_ID),
            FieldSpec::vendor(IE_OLSR_VALID_UNTIL, 4, OLSR_ENTERPRISE_ID),
        ],
    )
}

fn mid_template(family: AddressFamily, id: u16) -> Template {
    Template::new(
        id,
        vec![
            originator_field(family),
            FieldSpec::vendor(IE_OLSR_MID_ALIAS, addr_len(family), OLSR_ENTERPRISE_ID),
            FieldSpec::vendor(IE_OLSR_VALID_UNTIL, 4, OLSR_ENTERPRISE_ID),
        ],
    )
}

fn hna_template(family: AddressFamily, id: u16) -> Template {
    Template::new(
        id,
        vec![
            originator_field(family),
            FieldSpec::vendor(IE_OLSR_HNA_NETWORK, addr_len(family), OLSR_ENTERPRISE_ID),
            FieldSpec::vendor(IE_OLSR_HNA_PREFIX_LENGTH, 1, OLSR_ENTERPRISE_ID),
            FieldSpec::vendor(IE_OLSR_VALID_UNTIL, 4, OLSR_ENTERPRISE_ID),
        ],
    )
}

fn capture_stats_template() -> Template {
    Template::new(
        TEMPLATE_CAPTURE_STATS,
        vec![
            FieldSpec::iana(IE_INGRESS_INTERFACE, 4),
            FieldSpec::iana(IE_PACKET_TOTAL_COUNT, 8),
            FieldSpec::iana(IE_DROPPED_PACKET_TOTAL_COUNT, 8),
            FieldSpec::vendor(IE_OLSR_IF_DROPPED, 8, OLSR_ENTERPRISE_ID),
        ],
    )
}

/// Declares every observation-engine template with the exporter.
pub fn declare_templates(exporter: &mut Exporter) -> anyhow::Result<()> {
    exporter.declare_template(flow_template(AddressFamily::Ipv4))?;
    exporter.declare_template(flow_template(AddressFamily::Ipv6))?;
    exporter.declare_template(neighbor_template(AddressFamily::Ipv4, TEMPLATE_NEIGHBOR_V4))?;
    exporter.declare_template(neighbor_template(AddressFamily::Ipv6, TEMPLATE_NEIGHBOR_V6))?;
    exporter.declare_template(topology_template(AddressFamily::Ipv4, TEMPLATE_TOPOLOGY_V4))?;
    exporter.declare_template(topology_template(AddressFamily::Ipv6, TEMPLATE_TOPOLOGY_V6))?;
    exporter.declare_template(mid_template(AddressFamily::Ipv4, TEMPLATE_MID_V4))?;
    exporter.declare_template(mid_template(AddressFamily::Ipv6, TEMPLATE_MID_V6))?;
    exporter.declare_template(hna_template(AddressFamily::Ipv4, TEMPLATE_HNA_V4))?;
    exporter.declare_template(hna_template(AddressFamily::Ipv6, TEMPLATE_HNA_V6))?;
    exporter.declare_template(capture_stats_template())?;
    Ok(())
}

fn put_flow_record<A: Copy + Into<IpAddr>>(
    exporter: &mut Exporter,
    key: &FlowKey<A>,
    info: &FlowInfo,
) {
    exporter.put_addr(key.src_addr.into());
    exporter.put_addr(key.dst_addr.into());
    exporter.put_u16(key.src_port);
    exporter.put_u16(key.dst_port);
    exporter.put_u8(key.transport.protocol_number());
    exporter.put_u64(info.total_bytes);
    exporter.put_u64(info.total_packets);
    exporter.put_u32(info.first_packet.timestamp() as u32);
    exporter.put_u32(info.last_packet.timestamp() as u32);
}

/// Walks both flow maps: expired entries are evicted, everything else is
/// emitted with its cumulative counters.
pub fn export_flows(
    exporter: &mut Exporter,
    flows: &mut FlowTable,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    if !flows.v4.is_empty() {
        exporter.start_data_set(TEMPLATE_FLOW_V4)?;
        flows.sweep_v4(now, |key, info| put_flow_record(exporter, key, info));
        exporter.end_data_set()?;
    }

    if !flows.v6.is_empty() {
        exporter.start_data_set(TEMPLATE_FLOW_V6)?;
        flows.sweep_v6(now, |key, info| put_flow_record(exporter, key, info));
        exporter.end_data_set()?;
    }

    exporter.send_message()
}

fn family_matches(node: &NodeEntry, family: AddressFamily) -> bool {
    node.family == family
}

fn export_topology_family(
    exporter: &mut Exporter,
    nodes: &NodeStore,
    family: AddressFamily,
    templates: [u16; 4],
) -> anyhow::Result<()> {
    let [neighbor_id, topology_id, mid_id, hna_id] = templates;

    if nodes
        .nodes()
        .any(|(_, n)| family_matches(n, family) && !n.neighbors.is_empty())
    {
        exporter.start_data_set(neighbor_id)?;
        for (originator, node) in nodes.nodes().filter(|(_, n)| family_matches(n, family)) {
            for entry in &node.neighbors {
                exporter.put_addr(*originator);
                exporter.put_addr(entry.addr);
                exporter.put_u8(entry.lq);
                exporter.put_u8(entry.nlq);
                exporter.put_u32(entry.valid_until.timestamp() as u32);
            }
        }
        exporter.end_data_set()?;
    }

    if nodes.nodes().any(|(_, n)| {
        family_matches(n, family)
            && n.topology
                .as_ref()
                .map(|t| !t.entries.is_empty())
                .unwrap_or(false)
    }) {
        exporter.start_data_set(topology_id)?;
        for (originator, node) in nodes.nodes().filter(|(_, n)| family_matches(n, family)) {
            if let Some(topology) = &node.topology {
                for entry in &topology.entries {
                    exporter.put_addr(*originator);
                    exporter.put_addr(entry.dest);
                    exporter.put_u8(entry.lq);
                    exporter.put_u8(entry.nlq);
                    exporter.put_u16(topology.ansn);
                    exporter.put_u32(entry.valid_until.timestamp() as u32);
                }
            }
        }
        exporter.end_data_set()?;
    }

    if nodes
        .nodes()
        .any(|(_, n)| family_matches(n, family) && !n.mid.is_empty())
    {
        exporter.start_data_set(mid_id)?;
        for (originator, node) in nodes.nodes().filter(|(_, n)| family_matches(n, family)) {
            for entry in &node.mid {
                exporter.put_addr(*originator);
                exporter.put_addr(entry.alias);
                exporter.put_u32(entry.valid_until.timestamp() as u32);
            }
        }
        exporter.end_data_set()?;
    }

    if nodes
        .nodes()
        .any(|(_, n)| family_matches(n, family) && !n.hna.is_empty())
    {
        exporter.start_data_set(hna_id)?;
        for (originator, node) in nodes.nodes().filter(|(_, n)| family_matches(n, family)) {
            for entry in &node.hna {
                exporter.put_addr(*originator);
                exporter.put_addr(entry.network);
                exporter.put_u8(entry.prefix_len);
                exporter.put_u32(entry.valid_until.timestamp() as u32);
            }
        }
        exporter.end_data_set()?;
    }

    Ok(())
}

/// Expires stale set entries, then emits one record per remaining entry of
/// every node's neighbor, topology, MID and HNA sets.
pub fn export_topology(
    exporter: &mut Exporter,
    nodes: &mut NodeStore,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    nodes.expire(now);

    export_topology_family(
        exporter,
        nodes,
        AddressFamily::Ipv4,
        [
            TEMPLATE_NEIGHBOR_V4,
            TEMPLATE_TOPOLOGY_V4,
            TEMPLATE_MID_V4,
            TEMPLATE_HNA_V4,
        ],
    )?;
    export_topology_family(
        exporter,
        nodes,
        AddressFamily::Ipv6,
        [
            TEMPLATE_NEIGHBOR_V6,
            TEMPLATE_TOPOLOGY_V6,
            TEMPLATE_MID_V6,
            TEMPLATE_HNA_V6,
        ],
    )?;

    exporter.send_message()
}

/// Reads the kernel capture counters of every interface and emits one
/// statistics record each.
pub fn export_capture_stats(
    exporter: &mut Exporter,
    captures: &[CaptureHandle],
) -> anyhow::Result<()> {
    if captures.is_empty() {
        return Ok(());
    }

    exporter.start_data_set(TEMPLATE_CAPTURE_STATS)?;
    for capture in captures {
        let stats = match capture.stats() {
            Ok(stats) => stats,
            Err(err) => {
                tracing::error!("failed to read capture statistics on {}: {}", capture.name(), err);
                continue;
            }
        };
        exporter.put_u32(capture.ifindex() as u32);
        exporter.put_u64(u64::from(stats.received));
        exporter.put_u64(u64::from(stats.dropped));
        // AF_PACKET exposes no per-interface drop counter.
        exporter.put_u64(0);
    }
    exporter.end_data_set()?;

    exporter.send_message()
}
