//! Command/result correlation channel.
//!
//! Fire-and-forget publish, best-effort poll: trace commands are pushed to
//! a chassis under a short TTL, agents report per-hop results back under
//! the command id, and collection is a single prefix read sorted by the
//! per-result sequence counter. Nothing here guarantees delivery; missing
//! results are simply absent from the collected set.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::kv::KvStore;

/// Commands self-expire if no agent consumes them.
pub const CMD_TTL_SECS: i64 = 10;
/// Results are diagnostics; the store garbage-collects them via the lease.
pub const RESULT_TTL_SECS: i64 = 30;

static CMD_COUNTER: AtomicU16 = AtomicU16::new(0);

/// Next 16-bit command id: wall-clock centiseconds mixed with a
/// process-local counter. The small id space means reuse across
/// long-running sessions; each trace round tolerates that by construction
/// (results are only read back within the round's bounded wait).
pub fn next_cmd_id() -> u16 {
    let centis = (Utc::now().timestamp_millis() / 10) as u16;
    centis.wrapping_add(CMD_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// One pipeline-stage observation, as reported by an agent.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRecord {
    pub table_id: u32,
    pub datapath_id: u64,
    pub src_port_id: u32,
    pub dst_port_id: u32,
    pub tun_src: Ipv4Addr,
    pub output_iface_id: String,
    pub chassis_id: String,
    /// Monotonic per-result counter; the real hop order regardless of
    /// arrival time or reporting chassis.
    pub seq_n: u64,
}

pub fn command_key(root: &str, chassis: &str, cmd_id: u16) -> String {
    format!("{root}communicate/push/{chassis}/cmd/{cmd_id}")
}

pub fn command_value(packet_hex: &str, port: &str) -> String {
    format!("cmd=pkt_trace,packet={packet_hex},port={port}")
}

pub fn result_key(root: &str, cmd_id: u16, seq_n: u64, chassis: &str) -> String {
    format!("{root}communicate/cmd_result/{cmd_id}/{seq_n}/{chassis}")
}

pub fn result_value(rec: &TraceRecord) -> String {
    format!(
        "cmd_type=pkt_trace,table_id={},datapath_id={},src_port_id={},dst_port_id={},tun_src={},output_iface_id={}",
        rec.table_id,
        rec.datapath_id,
        rec.src_port_id,
        rec.dst_port_id,
        rec.tun_src,
        rec.output_iface_id
    )
}

/// Rebuild a [`TraceRecord`] from a result key/value pair. The key tail
/// carries `{seq_n}/{chassis}`; the value carries the hop fields.
pub fn parse_result(key: &str, value: &str) -> Result<TraceRecord> {
    let mut tail = key.rsplit('/');
    let chassis_id = tail
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::KeyPath(key.to_string()))?
        .to_string();
    let seq_n = tail
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::KeyPath(key.to_string()))?;

    let mut table_id = None;
    let mut datapath_id = None;
    let mut src_port_id = None;
    let mut dst_port_id = None;
    let mut tun_src = None;
    let mut output_iface_id = None;
    let mut cmd_type = None;
    for pair in value.split(',') {
        let Some((k, v)) = pair.split_once('=') else {
            continue;
        };
        match k {
            "cmd_type" => cmd_type = Some(v),
            "table_id" => table_id = v.parse().ok(),
            "datapath_id" => datapath_id = v.parse().ok(),
            "src_port_id" => src_port_id = v.parse().ok(),
            "dst_port_id" => dst_port_id = v.parse().ok(),
            "tun_src" => tun_src = v.parse().ok(),
            "output_iface_id" => output_iface_id = Some(v.to_string()),
            _ => {}
        }
    }
    if cmd_type != Some("pkt_trace") {
        return Err(Error::Field {
            field: "cmd_type",
            value: value.to_string(),
        });
    }
    fn req<T>(field: &'static str, value: &str, v: Option<T>) -> Result<T> {
        v.ok_or_else(|| Error::Field {
            field,
            value: value.to_string(),
        })
    }
    Ok(TraceRecord {
        table_id: req("table_id", value, table_id)?,
        datapath_id: req("datapath_id", value, datapath_id)?,
        src_port_id: req("src_port_id", value, src_port_id)?,
        dst_port_id: req("dst_port_id", value, dst_port_id)?,
        tun_src: req("tun_src", value, tun_src)?,
        output_iface_id: output_iface_id.unwrap_or_default(),
        chassis_id,
        seq_n,
    })
}

/// Publishes keyed, TTL-bounded commands and results, and collects all
/// results under a command id.
#[derive(Clone)]
pub struct CommandChannel {
    store: KvStore,
}

impl CommandChannel {
    pub fn new(store: KvStore) -> Self {
        CommandChannel { store }
    }

    /// Push a trace command at `chassis`. Self-expires after
    /// [`CMD_TTL_SECS`] if no agent picks it up.
    pub async fn publish_command(
        &self,
        chassis: &str,
        cmd_id: u16,
        packet_hex: &str,
        port: &str,
    ) -> Result<()> {
        let key = command_key(self.store.root(), chassis, cmd_id);
        let value = command_value(packet_hex, port);
        self.store.publish_with_ttl(&key, &value, CMD_TTL_SECS).await
    }

    /// Report one hop observation under `(cmd_id, seq_n, chassis)`.
    pub async fn publish_result(&self, cmd_id: u16, rec: &TraceRecord) -> Result<()> {
        let key = result_key(self.store.root(), cmd_id, rec.seq_n, &rec.chassis_id);
        let value = result_value(rec);
        self.store
            .publish_with_ttl(&key, &value, RESULT_TTL_SECS)
            .await
    }

    /// Collect every result currently under `cmd_id`, sorted strictly by
    /// `seq_n`. Malformed records are logged and skipped; absent results
    /// are not an error.
    pub async fn collect_results(&self, cmd_id: u16) -> Result<Vec<TraceRecord>> {
        let prefix = format!("{}communicate/cmd_result/{}/", self.store.root(), cmd_id);
        let (pairs, _) = self.store.read_prefix(&prefix).await?;
        let mut records = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            match parse_result(&key, &value) {
                Ok(rec) => records.push(rec),
                Err(e) => warn!(key = %key, error = %e, "skipping malformed trace result"),
            }
        }
        records.sort_by_key(|r| r.seq_n);
        debug!(cmd_id, count = records.len(), "collected trace results");
        Ok(records)
    }
}
