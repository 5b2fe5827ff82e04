//! Libvirt storage and network XML using facet-xml struct serialization.

use facet::Facet;
use facet_xml as xml;

use crate::error::MulchError;

// ── volumes ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Facet)]
#[facet(rename = "volume")]
pub struct VolumeDef {
    pub name: String,
    /// Bytes.
    pub capacity: u64,
    pub target: VolumeTarget,
}

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct VolumeTarget {
    pub path: String,
    pub format: VolumeFormat,
}

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct VolumeFormat {
    #[facet(xml::attribute, rename = "type")]
    pub kind: String,
}

/// `qcow2` for `.qcow2` volumes, `raw` for everything else.
pub fn volume_format(name: &str) -> &'static str {
    if name.ends_with(".qcow2") { "qcow2" } else { "raw" }
}

pub fn volume_xml(name: &str, capacity: u64, path: &str) -> Result<String, MulchError> {
    let def = VolumeDef {
        name: name.into(),
        capacity,
        target: VolumeTarget {
            path: path.into(),
            format: VolumeFormat {
                kind: volume_format(name).into(),
            },
        },
    };
    facet_xml::to_string(&def).map_err(|e| MulchError::Volume {
        pool: String::new(),
        name: name.into(),
        message: format!("volume XML serialization failed: {e}"),
    })
}

pub fn parse_volume_xml(text: &str) -> Result<VolumeDef, MulchError> {
    facet_xml::from_str(text).map_err(|e| MulchError::Volume {
        pool: String::new(),
        name: String::new(),
        message: format!("invalid volume XML: {e}"),
    })
}

// ── pools ──────────────────────────────────────────────────

#[derive(Debug, Facet)]
#[facet(rename = "pool")]
struct PoolDef {
    #[facet(xml::attribute, rename = "type")]
    kind: String,
    name: String,
    target: PoolTarget,
}

#[derive(Debug, Facet)]
struct PoolTarget {
    path: String,
    permissions: PoolPermissions,
}

#[derive(Debug, Facet)]
struct PoolPermissions {
    mode: String,
}

/// Directory-backed pool definition.
pub fn pool_xml(name: &str, path: &str, mode: &str) -> Result<String, MulchError> {
    let def = PoolDef {
        kind: "dir".into(),
        name: name.into(),
        target: PoolTarget {
            path: path.into(),
            permissions: PoolPermissions { mode: mode.into() },
        },
    };
    facet_xml::to_string(&def).map_err(|e| MulchError::Libvirt {
        message: format!("pool XML serialization failed: {e}"),
        hint: String::new(),
    })
}

/// Extract `<target><path>` from a pool description returned by libvirt.
pub fn pool_target_path(pool_xml: &str) -> Option<String> {
    let target = &pool_xml[pool_xml.find("<target>")?..];
    let start = target.find("<path>")? + "<path>".len();
    let end = target[start..].find("</path>")? + start;
    Some(target[start..end].trim().to_string())
}

// ── network ────────────────────────────────────────────────

#[derive(Debug, Facet)]
#[facet(rename = "network")]
struct NetworkDef {
    name: String,
    forward: NetworkForward,
    ip: NetworkIp,
}

#[derive(Debug, Facet)]
struct NetworkForward {
    #[facet(xml::attribute)]
    mode: String,
}

#[derive(Debug, Facet)]
struct NetworkIp {
    #[facet(xml::attribute)]
    address: String,
    #[facet(xml::attribute)]
    netmask: String,
    dhcp: NetworkDhcp,
}

#[derive(Debug, Facet)]
struct NetworkDhcp {
    range: DhcpRange,
}

#[derive(Debug, Facet)]
struct DhcpRange {
    #[facet(xml::attribute)]
    start: String,
    #[facet(xml::attribute)]
    end: String,
}

/// NAT network with DHCP over `<subnet>.0/24`; the host takes `.1`.
pub fn network_xml(name: &str, subnet: &str) -> Result<String, MulchError> {
    let net = NetworkDef {
        name: name.into(),
        forward: NetworkForward { mode: "nat".into() },
        ip: NetworkIp {
            address: format!("{subnet}.1"),
            netmask: "255.255.255.0".into(),
            dhcp: NetworkDhcp {
                range: DhcpRange {
                    start: format!("{subnet}.100"),
                    end: format!("{subnet}.254"),
                },
            },
        },
    };
    facet_xml::to_string(&net).map_err(|e| MulchError::Libvirt {
        message: format!("network XML serialization failed: {e}"),
        hint: String::new(),
    })
}
