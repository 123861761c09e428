// ── Live printer status ──
//
// Transport-agnostic view of what a printer is doing right now. Built by
// `convert` from whichever wire shape the transport delivers; derived
// fields on `PrintJob` are always recomputed, never copied from the wire.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Overall machine activity (`CurrentStatus` on SDCP boards).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Idle,
    Printing,
    FileTransferring,
    ExposureTesting,
    DevicesTesting,
    Unknown(i64),
}

impl MachineStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Idle,
            1 => Self::Printing,
            2 => Self::FileTransferring,
            3 => Self::ExposureTesting,
            4 => Self::DevicesTesting,
            other => Self::Unknown(other),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Printing => "printing",
            Self::FileTransferring => "file transferring",
            Self::ExposureTesting => "exposure testing",
            Self::DevicesTesting => "devices testing",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Print job phase (`PrintInfo.Status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrintStatus {
    Idle,
    Homing,
    Dropping,
    Exposuring,
    Lifting,
    Pausing,
    Paused,
    Stopping,
    Stopped,
    Complete,
    FileChecking,
    Printing,
    Heating,
    BedLeveling,
    Unknown(i64),
}

impl PrintStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Idle,
            1 => Self::Homing,
            2 => Self::Dropping,
            3 => Self::Exposuring,
            4 => Self::Lifting,
            5 => Self::Pausing,
            6 => Self::Paused,
            7 => Self::Stopping,
            8 => Self::Stopped,
            9 => Self::Complete,
            10 => Self::FileChecking,
            13 => Self::Printing,
            16 => Self::Heating,
            18 => Self::BedLeveling,
            other => Self::Unknown(other),
        }
    }

    /// Inverted-MQTT boards report the job state as a word.
    pub fn from_state_name(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "printing" | "running" => Self::Printing,
            "paused" => Self::Paused,
            "pausing" => Self::Pausing,
            "completed" | "complete" | "finished" => Self::Complete,
            "cancelled" | "canceled" | "stopped" => Self::Stopped,
            "stopping" => Self::Stopping,
            "heating" | "preheating" => Self::Heating,
            "leveling" | "bed_leveling" => Self::BedLeveling,
            "homing" => Self::Homing,
            "standby" | "idle" | "" => Self::Idle,
            _ => Self::Unknown(-1),
        }
    }

    /// A job is under way (including paused).
    pub fn is_active(self) -> bool {
        !matches!(
            self,
            Self::Idle | Self::Stopped | Self::Complete | Self::Unknown(_)
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Homing => "homing",
            Self::Dropping => "dropping",
            Self::Exposuring => "exposing",
            Self::Lifting => "lifting",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Complete => "complete",
            Self::FileChecking => "file checking",
            Self::Printing => "printing",
            Self::Heating => "heating",
            Self::BedLeveling => "bed leveling",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Current print job. Times are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrintJob {
    pub status: PrintStatus,
    pub filename: Option<String>,
    pub task_id: Option<String>,
    pub current_layer: u32,
    pub total_layers: u32,
    pub current_time_ms: u64,
    pub total_time_ms: u64,
    pub error_code: i64,
    pub print_speed_pct: Option<u32>,

    // Derived
    pub percent_complete: f64,
    pub remaining_layers: u32,
    pub remaining_time_ms: u64,
}

impl Default for PrintJob {
    fn default() -> Self {
        Self {
            status: PrintStatus::Idle,
            filename: None,
            task_id: None,
            current_layer: 0,
            total_layers: 0,
            current_time_ms: 0,
            total_time_ms: 0,
            error_code: 0,
            print_speed_pct: None,
            percent_complete: 0.0,
            remaining_layers: 0,
            remaining_time_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Temperature {
    pub current: f64,
    pub target: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Temperatures {
    pub nozzle: Option<Temperature>,
    pub bed: Option<Temperature>,
    pub chamber: Option<Temperature>,
    /// Resin boards: UV LED temperature.
    pub uv_led: Option<f64>,
}

/// Fan speeds in percent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FanSpeeds {
    pub model: Option<u32>,
    pub auxiliary: Option<u32>,
    pub chamber: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LightState {
    pub on: bool,
    pub rgb: Option<[u8; 3]>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Point-in-time printer status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub machine_status: MachineStatus,
    /// Every concurrent machine activity the board reported.
    pub machine_statuses: Vec<MachineStatus>,
    pub print: PrintJob,
    pub temperatures: Temperatures,
    pub fans: FanSpeeds,
    pub light: Option<LightState>,
    pub position: Option<Position>,
    pub z_offset: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            machine_status: MachineStatus::Idle,
            machine_statuses: Vec::new(),
            print: PrintJob::default(),
            temperatures: Temperatures::default(),
            fans: FanSpeeds::default(),
            light: None,
            position: None,
            z_offset: None,
            updated_at: Utc::now(),
        }
    }
}
