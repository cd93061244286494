//! Routing rules: may one port legally feed another?

use crate::model::IoData;

/// Families that carry discrete audio channels and may feed each other.
const AUDIO_SOURCES: &[&str] = &["ANALO_IN", "SDI_ACH", "AES_CH", "MADI_CH", "DANTE_CH"];
const AUDIO_DESTINATIONS: &[&str] = &["ANALO_OUT", "SDI_ACH", "MADI_CH", "DANTE_CH", "AES_CH"];
const AES_FAMILY: &[&str] = &["AES", "MADI_AES_CH"];
const SDI_DESTINATIONS: &[&str] = &["SDI", "SDI_PV"];

/// Protocol compatibility matrix, ignoring direction and bandwidth.
pub fn protocols_compatible(src: &str, dst: &str) -> bool {
    match src {
        "GPI" => dst == "GPO",
        s if AUDIO_SOURCES.contains(&s) => AUDIO_DESTINATIONS.contains(&dst),
        s if AES_FAMILY.contains(&s) => AES_FAMILY.contains(&dst),
        "SDI" => SDI_DESTINATIONS.contains(&dst),
        _ => src == dst,
    }
}

/// Whether the source's signal fits the destination's best standard.
///
/// Ports without an active standard (GPIO and friends) always fit.
pub fn bandwidth_fits(src: &IoData, dst: &IoData) -> bool {
    match src.effective_bandwidth() {
        Some(bw) => bw <= dst.max_bandwidth(),
        None => true,
    }
}

/// Decide whether `src` may be routed to `dst`.
pub fn can_route(src: &IoData, dst: &IoData) -> bool {
    if src.key == dst.key {
        return false;
    }

    if !src.is_input() || !dst.is_output() {
        return false;
    }

    if !src.enabled || !dst.enabled {
        return false;
    }

    // Any SDI input may be previewed
    if src.protocol == "SDI" && dst.protocol == "SDI_PV" {
        return true;
    }

    if !protocols_compatible(&src.protocol, &dst.protocol) {
        return false;
    }

    bandwidth_fits(src, dst)
}
