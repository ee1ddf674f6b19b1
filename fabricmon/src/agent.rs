//! Message protocol to the per-host packet-processing agent.
//!
//! The agent is a spawned child process that writes `;`-terminated command
//! lists to its stdout; each command is a comma-separated field list led by
//! an opcode. One malformed command never stops the batch: the per-command
//! parser returns a plain `Result` and the loop logs and moves on.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{CommandChannel, TraceRecord};
use crate::entity::EntityKind;
use crate::error::{Error, Result};
use crate::store::Topology;
use crate::worker::{WorkerStatus, status_channel};

/// Largest single read from the agent pipe. Commands crossing a read
/// boundary wait in the reassembly buffer for the next read.
pub const MAX_READ_LEN: usize = 10240;

/// Agents report `0xffff` for a port the pipeline considers invalid.
pub const INVALID_PORT: &str = "<INVALID_PORT>";
/// Rendered when an ofport cannot be resolved to an interface id.
pub const UNKNOWN_PORT: &str = "<UNK_PORT>";

/// One parsed agent command.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMsg {
    /// Observed ARP binding.
    Arp { datapath_id: u64, mac: String, ip: u32 },
    /// One pipeline-stage trace observation.
    Trace {
        table_id: u32,
        datapath_id: u64,
        /// Carries the command id in its high 16 bits.
        cmd_tag: u32,
        src_port_id: u32,
        dst_port_id: u32,
        tun_src: u32,
        seq_n: u64,
        ofport: u32,
    },
    /// The agent could not resolve a destination.
    UnknownDst { datapath_id: u64, ip: u32 },
}

fn seg<'a>(segments: &[&'a str], idx: usize, cmd: &str) -> Result<&'a str> {
    segments
        .get(idx)
        .copied()
        .ok_or_else(|| Error::Truncated(cmd.to_string()))
}

fn num<T: std::str::FromStr>(segments: &[&str], idx: usize, field: &'static str, cmd: &str) -> Result<T> {
    let raw = seg(segments, idx, cmd)?;
    raw.parse().map_err(|_| Error::Field {
        field,
        value: raw.to_string(),
    })
}

/// Parse one `,`-separated command. Field order is fixed; numeric fields
/// are decimal.
pub fn parse_command(cmd: &str) -> Result<AgentMsg> {
    let segments: Vec<&str> = cmd.split(',').collect();
    match segments[0] {
        "arp" => Ok(AgentMsg::Arp {
            datapath_id: num(&segments, 1, "datapath_id", cmd)?,
            mac: seg(&segments, 2, cmd)?.to_string(),
            ip: num(&segments, 3, "ip", cmd)?,
        }),
        "trace" => Ok(AgentMsg::Trace {
            table_id: num(&segments, 1, "table_id", cmd)?,
            datapath_id: num(&segments, 2, "datapath_id", cmd)?,
            cmd_tag: num(&segments, 3, "cmd_tag", cmd)?,
            src_port_id: num(&segments, 4, "src_port_id", cmd)?,
            dst_port_id: num(&segments, 5, "dst_port_id", cmd)?,
            tun_src: num(&segments, 6, "tun_src", cmd)?,
            seq_n: num(&segments, 7, "seq_n", cmd)?,
            ofport: num(&segments, 8, "ofport", cmd)?,
        }),
        "unknow_dst" => Ok(AgentMsg::UnknownDst {
            datapath_id: num(&segments, 1, "datapath_id", cmd)?,
            ip: num(&segments, 2, "ip", cmd)?,
        }),
        opcode => Err(Error::Opcode(opcode.to_string())),
    }
}

/// Drain every complete `;`-terminated command out of the reassembly
/// buffer, leaving a trailing partial command (if any) in place.
pub fn drain_commands(buf: &mut Vec<u8>) -> Vec<String> {
    let Some(end) = buf.iter().rposition(|&b| b == b';') else {
        return Vec::new();
    };
    let rest = buf.split_off(end + 1);
    let complete = std::mem::replace(buf, rest);
    String::from_utf8_lossy(&complete)
        .split(';')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

/// Process-lifetime ARP cache, used only for write deduplication.
#[derive(Default)]
pub struct ArpCache {
    inner: Mutex<HashMap<u32, String>>,
}

impl ArpCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the binding; returns false on an exact (ip, mac) repeat.
    pub fn update(&self, ip: u32, mac: &str) -> bool {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match map.get(&ip) {
            Some(known) if known == mac => false,
            _ => {
                map.insert(ip, mac.to_string());
                true
            }
        }
    }
}

/// Boundary to the out-of-scope local dataplane: ARP pushdown and full
/// state re-push live on the other side of this trait.
pub trait DataplaneOps: Send + Sync {
    fn push_arp(&self, mac: &str, ip: Ipv4Addr);
    fn repush(&self);
}

/// Default implementation for deployments where the dataplane side is
/// wired up elsewhere; it only leaves a log trail.
pub struct LogDataplane;

impl DataplaneOps for LogDataplane {
    fn push_arp(&self, mac: &str, ip: Ipv4Addr) {
        info!(mac = %mac, ip = %ip, "dataplane arp push requested");
    }

    fn repush(&self) {
        info!("dataplane re-push requested");
    }
}

/// Seam between the trace handler and the command/result channel, so the
/// handler is testable without a live store.
pub trait TraceReporter: Send + Sync {
    fn report(
        &self,
        cmd_id: u16,
        rec: &TraceRecord,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

impl TraceReporter for CommandChannel {
    async fn report(&self, cmd_id: u16, rec: &TraceRecord) -> Result<()> {
        self.publish_result(cmd_id, rec).await
    }
}

/// Dispatches parsed agent messages: ARP learning, trace reporting, and
/// unknown-destination handling.
pub struct AgentHandler<R> {
    topo: Arc<Topology>,
    reporter: R,
    arp_cache: ArpCache,
    dataplane: Arc<dyn DataplaneOps>,
    chassis_id: String,
}

impl<R: TraceReporter> AgentHandler<R> {
    pub fn new(
        topo: Arc<Topology>,
        reporter: R,
        dataplane: Arc<dyn DataplaneOps>,
        chassis_id: String,
    ) -> Self {
        AgentHandler {
            topo,
            reporter,
            arp_cache: ArpCache::new(),
            dataplane,
            chassis_id,
        }
    }

    pub async fn handle(&self, msg: AgentMsg) {
        match msg {
            AgentMsg::Arp {
                datapath_id,
                mac,
                ip,
            } => self.handle_arp(datapath_id, &mac, ip),
            AgentMsg::Trace {
                table_id,
                datapath_id,
                cmd_tag,
                src_port_id,
                dst_port_id,
                tun_src,
                seq_n,
                ofport,
            } => {
                self.handle_trace(
                    table_id,
                    datapath_id,
                    cmd_tag,
                    src_port_id,
                    dst_port_id,
                    tun_src,
                    seq_n,
                    ofport,
                )
                .await
            }
            AgentMsg::UnknownDst { datapath_id, ip } => self.handle_unknown_dst(datapath_id, ip),
        }
    }

    fn handle_arp(&self, datapath_id: u64, mac: &str, ip: u32) {
        let addr = Ipv4Addr::from(ip);
        if !self.arp_cache.update(ip, mac) {
            debug!(mac = %mac, ip = %addr, datapath_id, "skipping duplicate arp binding");
            return;
        }
        info!(mac = %mac, ip = %addr, datapath_id, "updating arp binding");
        self.dataplane.push_arp(mac, addr);
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_trace(
        &self,
        table_id: u32,
        datapath_id: u64,
        cmd_tag: u32,
        src_port_id: u32,
        dst_port_id: u32,
        tun_src: u32,
        seq_n: u64,
        ofport: u32,
    ) {
        let cmd_id = (cmd_tag >> 16) as u16;
        debug!(
            table_id,
            datapath_id, cmd_id, src_port_id, dst_port_id, seq_n, tun_src, ofport,
            "tracing packet"
        );
        let rec = TraceRecord {
            table_id,
            datapath_id,
            src_port_id,
            dst_port_id,
            tun_src: Ipv4Addr::from(tun_src),
            output_iface_id: self.resolve_ofport(ofport),
            chassis_id: self.chassis_id.clone(),
            seq_n,
        };
        if let Err(e) = self.reporter.report(cmd_id, &rec).await {
            warn!(cmd_id, seq_n, error = %e, "failed to publish trace result");
        }
    }

    fn resolve_ofport(&self, ofport: u32) -> String {
        match ofport {
            0xffff => INVALID_PORT.to_string(),
            0 => UNKNOWN_PORT.to_string(),
            _ => {
                let hits = self
                    .topo
                    .query(EntityKind::OvsPort, |e| e.ofport() == Some(ofport));
                match hits.iter().find_map(|e| e.iface_id()) {
                    Some(iface) => iface.to_string(),
                    None => {
                        info!(ofport, "cannot find iface-id for ofport");
                        UNKNOWN_PORT.to_string()
                    }
                }
            }
        }
    }

    fn handle_unknown_dst(&self, datapath_id: u64, ip: u32) {
        let addr = Ipv4Addr::from(ip);
        info!(datapath_id, ip = %addr, "received unknown-destination packet");

        let ports = self
            .topo
            .query(EntityKind::SwitchPort, |e| e.ip() == Some(addr));
        if ports.is_empty() {
            return;
        }

        let mut resolved = 0;
        for port in &ports {
            let Some(chassis) = port.chassis() else {
                continue;
            };
            if self.topo.get(EntityKind::Chassis, chassis).is_some() {
                resolved += 1;
            }
        }

        // A resolvable binding means the topology knows the destination but
        // the local dataplane does not: stale state, not an error.
        if resolved > 0 {
            self.dataplane.repush();
        }
    }
}

/// Where to find the agent binary and what environment to hand it.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_bin: PathBuf,
    pub log_dir: Option<String>,
}

/// Spawn the agent child process and the worker task that consumes its
/// stdout. End-of-stream (the agent died) stops the worker permanently;
/// the termination is signalled through the status receiver, not hidden.
pub fn spawn_agent_worker<R>(
    handler: Arc<AgentHandler<R>>,
    config: AgentConfig,
) -> Result<(JoinHandle<()>, watch::Receiver<WorkerStatus>)>
where
    R: TraceReporter + Send + Sync + 'static,
{
    let mut command = Command::new(&config.agent_bin);
    command.stdout(Stdio::piped()).kill_on_drop(true);
    if let Some(dir) = &config.log_dir {
        command.env("FABRICMON_LOGDIR", dir);
    }
    let mut child = command.spawn()?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Io(std::io::Error::other("agent stdout not captured")))?;
    info!(agent = %config.agent_bin.display(), "packet agent is running");

    let (status_tx, status_rx) = status_channel();
    let handle = tokio::spawn(async move {
        // Keep the child owned here so kill_on_drop fires at shutdown.
        let _child = child;
        let reason = match read_loop(&handler, &mut stdout).await {
            Ok(()) => "agent stream ended".to_string(),
            Err(e) => {
                warn!(error = %e, "agent worker failed");
                e.to_string()
            }
        };
        info!(reason = %reason, "agent worker stopped");
        let _ = status_tx.send(WorkerStatus::Stopped { reason });
    });
    Ok((handle, status_rx))
}

async fn read_loop<R, S>(handler: &AgentHandler<R>, stdout: &mut S) -> Result<()>
where
    R: TraceReporter,
    S: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; MAX_READ_LEN];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let n = stdout.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        pending.extend_from_slice(&chunk[..n]);
        for cmd in drain_commands(&mut pending) {
            match parse_command(&cmd) {
                Ok(msg) => handler.handle(msg).await,
                Err(e) => warn!(command = %cmd, error = %e, "skipping malformed agent command"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DeltaBatch;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullReporter;

    impl TraceReporter for NullReporter {
        async fn report(&self, _cmd_id: u16, _rec: &TraceRecord) -> Result<()> {
            Ok(())
        }
    }

    struct RecordingReporter {
        published: Mutex<Vec<(u16, TraceRecord)>>,
    }

    impl TraceReporter for &RecordingReporter {
        async fn report(&self, cmd_id: u16, rec: &TraceRecord) -> Result<()> {
            self.published.lock().unwrap().push((cmd_id, rec.clone()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingDataplane {
        arp_pushes: AtomicUsize,
        repushes: AtomicUsize,
    }

    impl DataplaneOps for CountingDataplane {
        fn push_arp(&self, _mac: &str, _ip: Ipv4Addr) {
            self.arp_pushes.fetch_add(1, Ordering::SeqCst);
        }

        fn repush(&self) {
            self.repushes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn topo_with(additions: &[(&str, &str)]) -> Arc<Topology> {
        let topo = Arc::new(Topology::new());
        topo.apply_delta(&DeltaBatch {
            additions: additions
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            removals: Vec::new(),
        });
        topo
    }

    #[test]
    fn test_parse_arp_command() {
        let msg = parse_command("arp,3,f2:01:00:00:00:01,167772161").unwrap();
        assert_eq!(
            msg,
            AgentMsg::Arp {
                datapath_id: 3,
                mac: "f2:01:00:00:00:01".to_string(),
                ip: 167772161, // 10.0.0.1
            }
        );
    }

    #[test]
    fn test_parse_trace_command() {
        let msg = parse_command("trace,17,2,5046272,1,2,3232238081,4,7").unwrap();
        match msg {
            AgentMsg::Trace {
                table_id,
                cmd_tag,
                seq_n,
                ofport,
                ..
            } => {
                assert_eq!(table_id, 17);
                assert_eq!(cmd_tag >> 16, 77);
                assert_eq!(seq_n, 4);
                assert_eq!(ofport, 7);
            }
            other => panic!("expected trace, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_opcode() {
        assert!(matches!(
            parse_command("frobnicate,1,2"),
            Err(Error::Opcode(_))
        ));
    }

    #[test]
    fn test_parse_rejects_non_numeric_field() {
        assert!(matches!(
            parse_command("arp,xyz,f2:01:00:00:00:01,1"),
            Err(Error::Field { field: "datapath_id", .. })
        ));
    }

    #[test]
    fn test_parse_rejects_truncated_command() {
        assert!(matches!(
            parse_command("trace,17,2"),
            Err(Error::Truncated(_))
        ));
    }

    #[test]
    fn test_drain_commands_keeps_partial_tail() {
        let mut buf = b"arp,1,aa,2;trace,17".to_vec();
        let cmds = drain_commands(&mut buf);
        assert_eq!(cmds, vec!["arp,1,aa,2".to_string()]);
        assert_eq!(buf, b"trace,17".to_vec());

        buf.extend_from_slice(b",2,5046272,1,2,3,4,7;");
        let cmds = drain_commands(&mut buf);
        assert_eq!(cmds, vec!["trace,17,2,5046272,1,2,3,4,7".to_string()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_drain_commands_without_terminator() {
        let mut buf = b"arp,1".to_vec();
        assert!(drain_commands(&mut buf).is_empty());
        assert_eq!(buf, b"arp,1".to_vec());
    }

    #[tokio::test]
    async fn test_malformed_command_does_not_stop_batch() {
        let dataplane = Arc::new(CountingDataplane::default());
        let handler = AgentHandler::new(
            topo_with(&[]),
            NullReporter,
            dataplane.clone(),
            "ch1".to_string(),
        );

        // A broken command followed by a valid one in the same batch; the
        // valid one must still be dispatched.
        let mut stream: &[u8] = b"trace,bad;arp,3,f2:01:00:00:00:01,167772161;";
        read_loop(&handler, &mut stream).await.unwrap();
        assert_eq!(dataplane.arp_pushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_arp_dedup() {
        let dataplane = Arc::new(CountingDataplane::default());
        let handler = AgentHandler::new(
            topo_with(&[]),
            NullReporter,
            dataplane.clone(),
            "ch1".to_string(),
        );

        let arp = parse_command("arp,3,f2:01:00:00:00:01,167772161").unwrap();
        handler.handle(arp.clone()).await;
        handler.handle(arp).await;
        assert_eq!(dataplane.arp_pushes.load(Ordering::SeqCst), 1);

        // Same ip, changed mac: must push again.
        let changed = parse_command("arp,3,f2:01:00:00:00:02,167772161").unwrap();
        handler.handle(changed).await;
        assert_eq!(dataplane.arp_pushes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_trace_publishes_result_with_resolved_iface() {
        let topo = topo_with(&[(
            "/f/entity_view/chassis/ch1/ovsport/vport1",
            "ofport=7,iface_id=lsp-m1,chassis=ch1",
        )]);
        let reporter = RecordingReporter {
            published: Mutex::new(Vec::new()),
        };
        let handler =
            AgentHandler::new(topo, &reporter, Arc::new(LogDataplane), "ch1".to_string());

        let msg = parse_command("trace,17,2,5046272,1,2,3232238081,4,7").unwrap();
        handler.handle(msg).await;

        let published = reporter.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let (cmd_id, rec) = &published[0];
        assert_eq!(*cmd_id, 77);
        assert_eq!(rec.output_iface_id, "lsp-m1");
        assert_eq!(rec.tun_src, Ipv4Addr::new(192, 168, 10, 1));
        assert_eq!(rec.chassis_id, "ch1");
    }

    #[tokio::test]
    async fn test_ofport_sentinels() {
        let handler = AgentHandler::new(
            topo_with(&[]),
            NullReporter,
            Arc::new(LogDataplane),
            "ch1".to_string(),
        );
        assert_eq!(handler.resolve_ofport(0xffff), INVALID_PORT);
        assert_eq!(handler.resolve_ofport(0), UNKNOWN_PORT);
        assert_eq!(handler.resolve_ofport(42), UNKNOWN_PORT);
    }

    #[tokio::test]
    async fn test_unknown_dst_triggers_repush_when_chassis_resolves() {
        let topo = topo_with(&[
            (
                "/f/entity_view/LS/ls1/lsp/p1",
                "ip=10.0.0.1,chassis=ch1",
            ),
            ("/f/entity_view/chassis/ch1", "ip=192.168.9.1"),
        ]);
        let dataplane = Arc::new(CountingDataplane::default());
        let handler = AgentHandler::new(topo, NullReporter, dataplane.clone(), "ch1".to_string());

        handler
            .handle(parse_command("unknow_dst,2,167772161").unwrap())
            .await;
        assert_eq!(dataplane.repushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_dst_without_chassis_is_quiet() {
        let topo = topo_with(&[("/f/entity_view/LS/ls1/lsp/p1", "ip=10.0.0.1")]);
        let dataplane = Arc::new(CountingDataplane::default());
        let handler = AgentHandler::new(topo, NullReporter, dataplane.clone(), "ch1".to_string());

        handler
            .handle(parse_command("unknow_dst,2,167772161").unwrap())
            .await;
        assert_eq!(dataplane.repushes.load(Ordering::SeqCst), 0);
    }
}
