//! Parsing for the device-status and block-topology queries.
//!
//! `udisksctl status` tells us which devices are genuinely attached storage
//! (kernel "removable" flags lie for devices like `/dev/xvda`); `lsblk --json`
//! gives us the partition tree for the selector.

use dropsafe_core::{ExportError, ExportResult};
use serde::Deserialize;

/// One node of the `lsblk` topology tree.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockDevice {
    pub name: String,

    #[serde(default)]
    pub ro: bool,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub mountpoint: Option<String>,

    #[serde(default)]
    pub fstype: Option<String>,

    #[serde(default)]
    pub children: Vec<BlockDevice>,
}

#[derive(Debug, Deserialize)]
struct BlockTopology {
    #[serde(default)]
    blockdevices: Vec<BlockDevice>,
}

/// Extract attached device names from `udisksctl status` output.
///
/// Rows look like `Label (may contain spaces)  Revision  Serial  sda`; the
/// final whitespace token is the device identifier. `udisksctl status`
/// always prints a fixed two-line column header first, so exactly those
/// lines are dropped rather than matching rows against the header text.
pub fn parse_attached_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(2)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split_whitespace().last())
        .map(|token| token.to_string())
        .collect()
}

/// Parse `lsblk --output NAME,RO,TYPE,MOUNTPOINT,FSTYPE --json` output.
///
/// An unparseable document or an empty device list is unrecoverable and maps
/// to `DEVICE_ERROR`.
pub fn parse_topology(payload: &str) -> ExportResult<Vec<BlockDevice>> {
    let topology: BlockTopology = serde_json::from_str(payload)
        .map_err(|err| ExportError::Device(format!("could not parse lsblk output: {err}")))?;

    if topology.blockdevices.is_empty() {
        return Err(ExportError::Device(
            "lsblk reported no block devices".to_string(),
        ));
    }

    Ok(topology.blockdevices)
}
