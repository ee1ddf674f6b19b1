//! Pipeline table-id to stage-name lookup.
//!
//! The agents report the numeric table id of the pipeline stage a probe was
//! observed at; rendering maps it back to a stable human-readable name.
//! The ids are part of the agent wire contract and must not be renumbered.

/// Rendered when an agent reports a table id outside the known pipeline.
pub const UNKNOWN_STAGE: &str = "<UNKNOWN_STAGE>";

// Logical-switch pipeline.
pub const TABLE_LSP_TRACE_INGRESS_IN: u32 = 0;
pub const TABLE_LSP_INGRESS_ARP_CONTROLLER: u32 = 1;
pub const TABLE_LSP_INGRESS_ARP_RESPONSE: u32 = 2;
pub const TABLE_LSP_INGRESS_LOOKUP_DST_PORT: u32 = 3;
pub const TABLE_LSP_INGRESS_OUTPUT_DST_PORT: u32 = 4;
pub const TABLE_LSP_EGRESS_PUSHOUT: u32 = 5;
pub const TABLE_LSP_TRACE_EGRESS_OUT: u32 = 6;

// Logical-router pipeline.
pub const TABLE_LRP_TRACE_INGRESS_IN: u32 = 10;
pub const TABLE_LRP_INGRESS_PKT_RESPONSE: u32 = 11;
pub const TABLE_LRP_INGRESS_UNSNAT: u32 = 12;
pub const TABLE_LRP_INGRESS_PREROUTE: u32 = 13;
pub const TABLE_LRP_INGRESS_IP_ROUTE: u32 = 14;
pub const TABLE_LRP_INGRESS_ECMP: u32 = 15;
pub const TABLE_LRP_EGRESS_SNAT: u32 = 16;
/// The egress-trace-output stage reports the *next* hop's datapath id by
/// construction of the pipeline; the orchestrator corrects for it.
pub const TABLE_LRP_TRACE_EGRESS_OUT: u32 = 17;

// Delivery.
pub const TABLE_OUTPUT_PKT: u32 = 20;

pub fn stage_name(table_id: u32) -> &'static str {
    match table_id {
        TABLE_LSP_TRACE_INGRESS_IN => "lsp_trace_ingress_in",
        TABLE_LSP_INGRESS_ARP_CONTROLLER => "lsp_ingress_arp_controller",
        TABLE_LSP_INGRESS_ARP_RESPONSE => "lsp_ingress_arp_response",
        TABLE_LSP_INGRESS_LOOKUP_DST_PORT => "lsp_ingress_lookup_dst_port",
        TABLE_LSP_INGRESS_OUTPUT_DST_PORT => "lsp_ingress_output_dst_port",
        TABLE_LSP_EGRESS_PUSHOUT => "lsp_egress_pushout",
        TABLE_LSP_TRACE_EGRESS_OUT => "lsp_trace_egress_out",
        TABLE_LRP_TRACE_INGRESS_IN => "lrp_trace_ingress_in",
        TABLE_LRP_INGRESS_PKT_RESPONSE => "lrp_ingress_pkt_response",
        TABLE_LRP_INGRESS_UNSNAT => "lrp_ingress_unsnat",
        TABLE_LRP_INGRESS_PREROUTE => "lrp_ingress_preroute",
        TABLE_LRP_INGRESS_IP_ROUTE => "lrp_ingress_ip_route",
        TABLE_LRP_INGRESS_ECMP => "lrp_ingress_ecmp",
        TABLE_LRP_EGRESS_SNAT => "lrp_egress_snat",
        TABLE_LRP_TRACE_EGRESS_OUT => "lrp_trace_egress_out",
        TABLE_OUTPUT_PKT => "output_pkt",
        _ => UNKNOWN_STAGE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_stage_names() {
        assert_eq!(stage_name(TABLE_LRP_TRACE_EGRESS_OUT), "lrp_trace_egress_out");
        assert_eq!(stage_name(TABLE_LSP_TRACE_INGRESS_IN), "lsp_trace_ingress_in");
    }

    #[test]
    fn test_unknown_stage_is_sentinel() {
        assert_eq!(stage_name(999), UNKNOWN_STAGE);
    }
}
