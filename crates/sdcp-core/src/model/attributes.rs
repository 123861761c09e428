// ── Static printer attributes ──

use serde::Serialize;

/// Mostly static facts about a printer. Replaced wholesale on every
/// attributes push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Attributes {
    pub name: String,
    pub machine_name: String,
    pub brand_name: Option<String>,
    pub mainboard_id: String,
    pub mainboard_ip: Option<String>,
    pub protocol_version: Option<String>,
    pub firmware_version: Option<String>,
    /// Screen or exposure resolution, e.g. `"11520x5120"`.
    pub resolution: Option<String>,
    /// Build volume, e.g. `"218.88x122.88x220"`.
    pub build_volume: Option<String>,
    pub capabilities: Vec<String>,
    pub supported_file_types: Vec<String>,
    pub video_streams_connected: Option<u32>,
    pub video_streams_max: Option<u32>,
    /// Free storage in bytes.
    pub remaining_memory: Option<u64>,
    pub camera_connected: Option<bool>,
    pub usb_disk_connected: Option<bool>,
}

impl Attributes {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.eq_ignore_ascii_case(capability))
    }
}
