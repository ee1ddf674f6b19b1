//! Logical-network entity model.
//!
//! Entities mirror objects published by the central controller into the
//! distributed store: logical switches and routers, their ports, chassis,
//! and ovsport-to-chassis bindings. Each kind has a fixed field set; fields
//! the schema does not know about land in a generic `extra` bag.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Fixed enumeration of entity kinds, keyed by the kind tag used in the
/// distributed-store key path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    LogicalSwitch,
    LogicalRouter,
    SwitchPort,
    RouterPort,
    Chassis,
    OvsPort,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::LogicalSwitch,
        EntityKind::LogicalRouter,
        EntityKind::SwitchPort,
        EntityKind::RouterPort,
        EntityKind::Chassis,
        EntityKind::OvsPort,
    ];

    /// Kind tag as it appears in the key path (second-to-last segment).
    pub fn tag(&self) -> &'static str {
        match self {
            EntityKind::LogicalSwitch => "LS",
            EntityKind::LogicalRouter => "LR",
            EntityKind::SwitchPort => "lsp",
            EntityKind::RouterPort => "lrp",
            EntityKind::Chassis => "chassis",
            EntityKind::OvsPort => "ovsport",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "LS" => Some(EntityKind::LogicalSwitch),
            "LR" => Some(EntityKind::LogicalRouter),
            "lsp" => Some(EntityKind::SwitchPort),
            "lrp" => Some(EntityKind::RouterPort),
            "chassis" => Some(EntityKind::Chassis),
            "ovsport" => Some(EntityKind::OvsPort),
            _ => None,
        }
    }

    /// Datapath kinds own ports; all other kinds are top-level.
    pub fn is_datapath(&self) -> bool {
        matches!(self, EntityKind::LogicalSwitch | EntityKind::LogicalRouter)
    }

    fn is_top_level(&self) -> bool {
        !matches!(self, EntityKind::SwitchPort | EntityKind::RouterPort)
    }
}

/// Kind-specific entity fields.
///
/// Numeric fields that fail to parse are left `None`; a lookup miss is
/// never fatal here, it surfaces later as a sentinel in trace output.
#[derive(Debug, Clone)]
pub enum EntityBody {
    LogicalSwitch {
        id: Option<u64>,
    },
    LogicalRouter {
        id: Option<u64>,
    },
    SwitchPort {
        ip: Option<Ipv4Addr>,
        mac: Option<String>,
        chassis: Option<String>,
    },
    RouterPort {
        ip: Option<Ipv4Addr>,
        mac: Option<String>,
        prefix: Option<u8>,
    },
    Chassis {
        ip: Option<Ipv4Addr>,
        tick: Option<u64>,
    },
    OvsPort {
        ofport: Option<u32>,
        iface_id: Option<String>,
        chassis: Option<String>,
    },
}

impl EntityBody {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityBody::LogicalSwitch { .. } => EntityKind::LogicalSwitch,
            EntityBody::LogicalRouter { .. } => EntityKind::LogicalRouter,
            EntityBody::SwitchPort { .. } => EntityKind::SwitchPort,
            EntityBody::RouterPort { .. } => EntityKind::RouterPort,
            EntityBody::Chassis { .. } => EntityKind::Chassis,
            EntityBody::OvsPort { .. } => EntityKind::OvsPort,
        }
    }
}

/// Value-like snapshot of one logical-network object.
///
/// The synchronizer owns the only mutable copy; every read path hands out
/// clones, never references that outlive the store lock.
#[derive(Debug, Clone)]
pub struct Entity {
    /// Key, unique within the kind.
    pub name: String,
    /// Owning datapath name; empty for top-level kinds.
    pub parent: String,
    pub body: EntityBody,
    /// Fields the fixed schema does not know about.
    pub extra: HashMap<String, String>,
}

impl Entity {
    /// Build an entity from a full store key path and its flat
    /// `k=v,k=v,...` value.
    pub fn from_kv(key_path: &str, value: &str) -> Result<Entity> {
        let (kind, parent, name) = parse_key_path(key_path)
            .ok_or_else(|| Error::KeyPath(key_path.to_string()))?;

        let mut extra = HashMap::new();
        let mut props: HashMap<&str, &str> = HashMap::new();
        for pair in value.split(',') {
            if pair.is_empty() {
                continue;
            }
            match pair.split_once('=') {
                Some((k, v)) => {
                    props.insert(k, v);
                }
                None => {
                    // Bare token without '='; keep it visible rather than drop it.
                    extra.insert(pair.to_string(), String::new());
                }
            }
        }

        let mut take = |field: &str| props.remove(field).map(str::to_string);
        let body = match kind {
            EntityKind::LogicalSwitch => EntityBody::LogicalSwitch {
                id: take("id").and_then(|v| v.parse().ok()),
            },
            EntityKind::LogicalRouter => EntityBody::LogicalRouter {
                id: take("id").and_then(|v| v.parse().ok()),
            },
            EntityKind::SwitchPort => EntityBody::SwitchPort {
                ip: take("ip").and_then(|v| v.parse().ok()),
                mac: take("mac"),
                chassis: take("chassis").filter(|c| !c.is_empty()),
            },
            EntityKind::RouterPort => EntityBody::RouterPort {
                ip: take("ip").and_then(|v| v.parse().ok()),
                mac: take("mac"),
                prefix: take("prefix").and_then(|v| v.parse().ok()),
            },
            EntityKind::Chassis => EntityBody::Chassis {
                ip: take("ip").and_then(|v| v.parse().ok()),
                tick: take("tick").and_then(|v| v.parse().ok()),
            },
            EntityKind::OvsPort => EntityBody::OvsPort {
                ofport: take("ofport").and_then(|v| v.parse().ok()),
                iface_id: take("iface_id"),
                chassis: take("chassis").filter(|c| !c.is_empty()),
            },
        };

        for (k, v) in props {
            extra.insert(k.to_string(), v.to_string());
        }

        Ok(Entity {
            name,
            parent,
            body,
            extra,
        })
    }

    pub fn kind(&self) -> EntityKind {
        self.body.kind()
    }

    /// Port/tunnel address, for the kinds that carry one.
    pub fn ip(&self) -> Option<Ipv4Addr> {
        match &self.body {
            EntityBody::SwitchPort { ip, .. }
            | EntityBody::RouterPort { ip, .. }
            | EntityBody::Chassis { ip, .. } => *ip,
            _ => None,
        }
    }

    /// Low 16 bits of the port IP; the compact port identifier agents report.
    pub fn ip_low16(&self) -> Option<u32> {
        self.ip().map(|ip| u32::from(ip) & 0xffff)
    }

    /// Numeric datapath id, for logical switches and routers.
    pub fn datapath_id(&self) -> Option<u64> {
        match &self.body {
            EntityBody::LogicalSwitch { id } | EntityBody::LogicalRouter { id } => *id,
            _ => None,
        }
    }

    /// Chassis reference, for the kinds that carry one.
    pub fn chassis(&self) -> Option<&str> {
        match &self.body {
            EntityBody::SwitchPort { chassis, .. } | EntityBody::OvsPort { chassis, .. } => {
                chassis.as_deref()
            }
            _ => None,
        }
    }

    pub fn ofport(&self) -> Option<u32> {
        match &self.body {
            EntityBody::OvsPort { ofport, .. } => *ofport,
            _ => None,
        }
    }

    pub fn iface_id(&self) -> Option<&str> {
        match &self.body {
            EntityBody::OvsPort { iface_id, .. } => iface_id.as_deref(),
            _ => None,
        }
    }
}

/// Derive `(kind, parent, key)` from the last three segments of a store
/// key path. Returns `None` for keys that do not name a known entity kind.
pub fn parse_key_path(key_path: &str) -> Option<(EntityKind, String, String)> {
    let mut segments = key_path.split('/').rev();
    let name = segments.next()?;
    let tag = segments.next()?;
    let parent = segments.next().unwrap_or("");
    let kind = EntityKind::from_tag(tag)?;
    if name.is_empty() {
        return None;
    }
    let parent = if kind.is_top_level() {
        String::new()
    } else {
        parent.to_string()
    };
    Some((kind, parent, name.to_string()))
}
