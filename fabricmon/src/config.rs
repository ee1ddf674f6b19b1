use std::path::PathBuf;

use crate::error::{Error, Result};

/// Monitor daemon settings, assembled once at startup and handed by
/// reference to the components that need them.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Config-store endpoints, `host:port`.
    pub endpoints: Vec<String>,
    /// Key prefix under which all fabric state lives. Must end with `/`.
    pub prefix: String,
    /// Stable id of the local chassis; results are reported under it.
    pub chassis_id: String,
    /// Packet agent binary.
    pub agent_bin: PathBuf,
    /// Log directory handed to the agent via its environment.
    pub log_dir: Option<String>,
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.prefix.ends_with('/') {
            return Err(Error::Prefix(self.prefix.clone()));
        }
        Ok(())
    }
}
