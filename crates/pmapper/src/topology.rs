//! Topology scan
//!
//! External hubs only get their downstream port numbers assigned once the
//! hub itself is attached, so devices are reported one tier at a time,
//! parents before children.

use crate::types::{DeviceInfo, MAX_TIERS};
use tracing::{debug, error};

/// Report every attachable device in non-decreasing depth order
///
/// Root-hub nodes are skipped. Devices at depth [`MAX_TIERS`] or deeper are
/// never reported. Returns how many devices were reported.
pub fn scan_topology<F>(devices: &[DeviceInfo], mut connect: F) -> usize
where
    F: FnMut(&DeviceInfo),
{
    let mut pending: Vec<&DeviceInfo> = devices
        .iter()
        .filter(|info| !info.path.is_root_hub())
        .collect();
    let mut reported = 0;
    let mut depth = 1;

    while !pending.is_empty() {
        if depth >= MAX_TIERS {
            error!("max hub layers ({}) reached, stop scan", MAX_TIERS);
            break;
        }

        let (level, deeper): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|info| info.path.depth() == depth);

        for info in level {
            debug!("{}: tier {} device {:04x}:{:04x}", info.path, depth, info.vendor_id, info.product_id);
            connect(info);
            reported += 1;
        }

        // Only strictly deeper devices carry over
        pending = deeper
            .into_iter()
            .filter(|info| info.path.depth() > depth)
            .collect();
        depth += 1;
    }

    reported
}
