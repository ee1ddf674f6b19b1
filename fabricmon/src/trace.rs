//! Trace orchestration and path reconstruction.
//!
//! Turns an unordered bag of per-hop reports into an ordered logical path:
//! publish the command, wait a bounded interval, collect, resolve numeric
//! identifiers into logical names, apply the hop-boundary datapath
//! correction, and render one line per hop. Missing or unresolvable pieces
//! become sentinels, never failures.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::channel::{CommandChannel, TraceRecord, next_cmd_id};
use crate::entity::{Entity, EntityKind};
use crate::error::{Error, Result};
use crate::stage::{self, stage_name};
use crate::store::Topology;

/// Bounded wait between publishing the command and collecting results.
/// No acknowledgment protocol exists; this is best-effort by design.
pub const DEFAULT_RESULT_WAIT: Duration = Duration::from_secs(3);

/// Rendered for a port id that resolves to no known port.
pub const UNKNOWN_SYMBOL: &str = "<UNKNOWN>";

/// One rendered hop of the logical path.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceHop {
    Resolved {
        /// `LS` or `LR`.
        kind_tag: &'static str,
        datapath: String,
        src_port: String,
        dst_port: String,
        stage: &'static str,
        chassis: String,
    },
    /// The reported datapath id matched no known switch or router; the hop
    /// is kept in place so the path stays readable.
    Unresolved {
        datapath_id: u64,
        stage: &'static str,
        chassis: String,
    },
}

impl fmt::Display for TraceHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceHop::Resolved {
                kind_tag,
                datapath,
                src_port,
                dst_port,
                stage,
                chassis,
            } => write!(
                f,
                "type:{kind_tag},pipeline:{datapath},from:{src_port},to:{dst_port},stage:{stage},chassis:{chassis}"
            ),
            TraceHop::Unresolved {
                datapath_id,
                stage,
                chassis,
            } => write!(
                f,
                "<ERROR> unresolved datapath_id:{datapath_id},stage:{stage},chassis:{chassis}"
            ),
        }
    }
}

/// Reconstruct the ordered logical path from a bag of hop records.
///
/// Pure over the topology: sorts by `seq_n`, applies the hop-boundary
/// correction, then resolves names. The egress-trace-output stage of a
/// logical router reports the *next* hop's datapath id by construction of
/// the pipeline, so every such hop after the first takes the previous
/// hop's datapath id.
pub fn resolve_path(topo: &Topology, mut records: Vec<TraceRecord>) -> Vec<TraceHop> {
    records.sort_by_key(|r| r.seq_n);

    for i in 1..records.len() {
        if records[i].table_id == stage::TABLE_LRP_TRACE_EGRESS_OUT {
            records[i].datapath_id = records[i - 1].datapath_id;
        }
    }

    records.iter().map(|r| resolve_hop(topo, r)).collect()
}

fn resolve_hop(topo: &Topology, rec: &TraceRecord) -> TraceHop {
    let stage = stage_name(rec.table_id);
    let Some(datapath) = find_datapath(topo, rec.datapath_id) else {
        return TraceHop::Unresolved {
            datapath_id: rec.datapath_id,
            stage,
            chassis: rec.chassis_id.clone(),
        };
    };
    TraceHop::Resolved {
        kind_tag: datapath.kind().tag(),
        src_port: find_port_name(topo, &datapath, rec.src_port_id),
        dst_port: find_port_name(topo, &datapath, rec.dst_port_id),
        datapath: datapath.name,
        stage,
        chassis: rec.chassis_id.clone(),
    }
}

fn find_datapath(topo: &Topology, datapath_id: u64) -> Option<Entity> {
    EntityKind::ALL
        .into_iter()
        .filter(|kind| kind.is_datapath())
        .find_map(|kind| {
            topo.query(kind, |e| e.datapath_id() == Some(datapath_id))
                .into_iter()
                .next()
        })
}

/// Resolve a compact port id within one datapath. `0` is the agents'
/// unknown-port value; otherwise the id is the low 16 bits of the port IP.
fn find_port_name(topo: &Topology, datapath: &Entity, port_id: u32) -> String {
    if port_id == 0 {
        return UNKNOWN_SYMBOL.to_string();
    }
    let port_kind = match datapath.kind() {
        EntityKind::LogicalSwitch => EntityKind::SwitchPort,
        _ => EntityKind::RouterPort,
    };
    topo.query(port_kind, |e| {
        e.parent == datapath.name && e.ip_low16() == Some(port_id)
    })
    .into_iter()
    .next()
    .map(|e| e.name)
    .unwrap_or_else(|| UNKNOWN_SYMBOL.to_string())
}

/// Issues a trace round end to end.
pub struct TraceRunner {
    topo: Arc<Topology>,
    channel: CommandChannel,
    wait: Duration,
}

impl TraceRunner {
    pub fn new(topo: Arc<Topology>, channel: CommandChannel) -> Self {
        TraceRunner {
            topo,
            channel,
            wait: DEFAULT_RESULT_WAIT,
        }
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Inject `packet_hex` at logical port `port` and reconstruct the path
    /// it takes. Fails before publishing anything if the port has no
    /// chassis binding; partial result sets are returned as-is.
    pub async fn run(&self, port: &str, packet_hex: &str) -> Result<Vec<TraceHop>> {
        let chassis = self.resolve_ingress_chassis(port)?;
        let cmd_id = next_cmd_id();
        info!(port = %port, chassis = %chassis, cmd_id, "publishing trace command");
        self.channel
            .publish_command(&chassis, cmd_id, packet_hex, port)
            .await?;

        tokio::time::sleep(self.wait).await;

        let records = self.channel.collect_results(cmd_id).await?;
        debug!(cmd_id, hops = records.len(), "reconstructing trace path");
        Ok(resolve_path(&self.topo, records))
    }

    fn resolve_ingress_chassis(&self, port: &str) -> Result<String> {
        let lsp = self
            .topo
            .get(EntityKind::SwitchPort, port)
            .ok_or_else(|| Error::UnboundPort(port.to_string()))?;
        let chassis_name = lsp
            .chassis()
            .ok_or_else(|| Error::UnboundPort(port.to_string()))?;
        let chassis = self
            .topo
            .get(EntityKind::Chassis, chassis_name)
            .ok_or_else(|| Error::UnboundPort(port.to_string()))?;
        Ok(chassis.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DeltaBatch;
    use std::net::Ipv4Addr;

    fn topo_with(additions: &[(&str, &str)]) -> Topology {
        let topo = Topology::new();
        topo.apply_delta(&DeltaBatch {
            additions: additions
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            removals: Vec::new(),
        });
        topo
    }

    fn record(seq_n: u64, table_id: u32, datapath_id: u64) -> TraceRecord {
        TraceRecord {
            table_id,
            datapath_id,
            src_port_id: 1,
            dst_port_id: 2,
            tun_src: Ipv4Addr::new(192, 168, 9, 1),
            output_iface_id: "p1".to_string(),
            chassis_id: "ch1".to_string(),
            seq_n,
        }
    }

    // Three-hop fabric: switch ls1 -> router lr1 -> switch ls2, each
    // datapath owning ports whose IP low 16 bits are 1 and 2.
    fn fabric() -> Topology {
        topo_with(&[
            ("/f/entity_view/LS/ls1", "id=1"),
            ("/f/entity_view/LR/lr1", "id=2"),
            ("/f/entity_view/LS/ls2", "id=3"),
            ("/f/entity_view/LS/ls1/lsp/lsp1", "ip=10.0.0.1,chassis=ch1"),
            ("/f/entity_view/LS/ls1/lsp/lsp2", "ip=10.0.0.2"),
            ("/f/entity_view/LR/lr1/lrp/lrp1", "ip=10.1.0.1"),
            ("/f/entity_view/LR/lr1/lrp/lrp2", "ip=10.1.0.2"),
            ("/f/entity_view/LS/ls2/lsp/lsp3", "ip=10.2.0.1"),
            ("/f/entity_view/LS/ls2/lsp/lsp4", "ip=10.2.0.2"),
            ("/f/entity_view/chassis/ch1", "ip=192.168.9.1"),
        ])
    }

    #[test]
    fn test_records_sorted_by_seq() {
        let topo = fabric();
        let records = vec![
            record(3, stage::TABLE_LSP_TRACE_INGRESS_IN, 3),
            record(1, stage::TABLE_LSP_TRACE_INGRESS_IN, 1),
            record(2, stage::TABLE_LSP_TRACE_INGRESS_IN, 1),
        ];
        let hops = resolve_path(&topo, records);
        let names: Vec<_> = hops
            .iter()
            .map(|h| match h {
                TraceHop::Resolved { datapath, .. } => datapath.clone(),
                TraceHop::Unresolved { .. } => panic!("unexpected unresolved hop"),
            })
            .collect();
        assert_eq!(names, vec!["ls1", "ls1", "ls2"]);
    }

    #[test]
    fn test_boundary_correction_adopts_previous_datapath() {
        let topo = fabric();
        let records = vec![
            record(1, stage::TABLE_LSP_TRACE_INGRESS_IN, 1),
            // Egress-trace-output reports the *next* datapath (3).
            record(2, stage::TABLE_LRP_TRACE_EGRESS_OUT, 3),
            record(3, stage::TABLE_LSP_TRACE_INGRESS_IN, 3),
        ];
        let hops = resolve_path(&topo, records);
        match &hops[1] {
            TraceHop::Resolved { datapath, .. } => assert_eq!(datapath, "ls1"),
            other => panic!("expected resolved hop, got {other:?}"),
        }
    }

    #[test]
    fn test_boundary_correction_skips_first_hop() {
        let topo = fabric();
        let records = vec![record(1, stage::TABLE_LRP_TRACE_EGRESS_OUT, 2)];
        let hops = resolve_path(&topo, records);
        match &hops[0] {
            TraceHop::Resolved { datapath, .. } => assert_eq!(datapath, "lr1"),
            other => panic!("expected resolved hop, got {other:?}"),
        }
    }

    #[test]
    fn test_port_resolution_low16() {
        let topo = fabric();
        let ls1 = topo.get(EntityKind::LogicalSwitch, "ls1").unwrap();
        assert_eq!(find_port_name(&topo, &ls1, 1), "lsp1");
        assert_eq!(find_port_name(&topo, &ls1, 2), "lsp2");
        assert_eq!(find_port_name(&topo, &ls1, 0), UNKNOWN_SYMBOL);
        assert_eq!(find_port_name(&topo, &ls1, 999), UNKNOWN_SYMBOL);
    }

    #[test]
    fn test_router_ports_resolved_against_router() {
        let topo = fabric();
        let lr1 = topo.get(EntityKind::LogicalRouter, "lr1").unwrap();
        assert_eq!(find_port_name(&topo, &lr1, 1), "lrp1");
    }

    #[test]
    fn test_unresolved_datapath_keeps_hop_in_place() {
        let topo = fabric();
        let records = vec![
            record(1, stage::TABLE_LSP_TRACE_INGRESS_IN, 1),
            record(2, stage::TABLE_LSP_TRACE_INGRESS_IN, 42),
        ];
        let hops = resolve_path(&topo, records);
        assert_eq!(hops.len(), 2);
        match &hops[1] {
            TraceHop::Unresolved { datapath_id, .. } => assert_eq!(*datapath_id, 42),
            other => panic!("expected unresolved hop, got {other:?}"),
        }
        assert!(hops[1].to_string().starts_with("<ERROR>"));
    }

    #[test]
    fn test_end_to_end_three_hop_path() {
        let topo = fabric();
        // seq 2 sits at the router egress-trace-output boundary and
        // reports the next datapath id (3); the correction replaces it
        // with hop 1's datapath. Records arrive out of order.
        let records = vec![
            record(2, stage::TABLE_LRP_TRACE_EGRESS_OUT, 3),
            record(1, stage::TABLE_LSP_TRACE_INGRESS_IN, 1),
            record(3, stage::TABLE_LSP_TRACE_INGRESS_IN, 3),
        ];
        let hops = resolve_path(&topo, records);
        let rendered: Vec<String> = hops.iter().map(|h| h.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "type:LS,pipeline:ls1,from:lsp1,to:lsp2,stage:lsp_trace_ingress_in,chassis:ch1"
                    .to_string(),
                "type:LS,pipeline:ls1,from:lsp1,to:lsp2,stage:lrp_trace_egress_out,chassis:ch1"
                    .to_string(),
                "type:LS,pipeline:ls2,from:lsp3,to:lsp4,stage:lsp_trace_ingress_in,chassis:ch1"
                    .to_string(),
            ]
        );
        // All referenced entities exist: no sentinels anywhere.
        assert!(rendered.iter().all(|l| !l.contains(UNKNOWN_SYMBOL)));
        assert!(rendered.iter().all(|l| !l.contains("<ERROR>")));
    }
}
