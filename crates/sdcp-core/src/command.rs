// ── Printer commands ──
//
// One typed vocabulary for every transport. Numeric inputs are clamped to
// device-safe ranges before they are encoded.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum::{Display, EnumString};

use sdcp_api::mqtt::cc2::method;
use sdcp_api::sdcp::command as cmd;

use crate::model::{Attributes, PrintHistoryEntry, StatusSnapshot};

pub const FAN_RANGE: (u32, u32) = (0, 100);
pub const PRINT_SPEED_RANGE: (u32, u32) = (50, 160);
pub const NOZZLE_RANGE: (f64, f64) = (0.0, 320.0);
pub const BED_RANGE: (f64, f64) = (0.0, 110.0);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Fan {
    Model,
    #[strum(to_string = "auxiliary", serialize = "aux")]
    #[serde(alias = "aux")]
    Auxiliary,
    #[strum(to_string = "box", serialize = "chamber")]
    #[serde(alias = "chamber")]
    Box,
}

/// Everything a consumer can ask a printer to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    RefreshStatus,
    RefreshAttributes,
    Pause,
    Resume,
    Stop,
    SetFanSpeed { fan: Fan, percent: u32 },
    SetPrintSpeed { percent: u32 },
    SetNozzleTemp { celsius: f64 },
    SetBedTemp { celsius: f64 },
    SetLight { on: bool },
    SetVideo { enable: bool },
    ListHistory,
    HistoryDetail { task_ids: Vec<String> },
}

/// What a command produced, beyond the device's acknowledgement.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", content = "value", rename_all = "snake_case")]
pub enum CommandResult {
    Accepted,
    /// Stream URL after enabling video; `None` after disabling.
    VideoUrl(Option<String>),
    History(Arc<Vec<Arc<PrintHistoryEntry>>>),
    Status(Option<Arc<StatusSnapshot>>),
    Attributes(Option<Arc<Attributes>>),
}

fn clamp_f64(value: f64, (lo, hi): (f64, f64)) -> f64 {
    if value.is_nan() { lo } else { value.clamp(lo, hi) }
}

impl Command {
    /// Return a copy with every numeric input inside its device-safe range.
    pub fn clamped(&self) -> Self {
        match self {
            Self::SetFanSpeed { fan, percent } => Self::SetFanSpeed {
                fan: *fan,
                percent: (*percent).clamp(FAN_RANGE.0, FAN_RANGE.1),
            },
            Self::SetPrintSpeed { percent } => Self::SetPrintSpeed {
                percent: (*percent).clamp(PRINT_SPEED_RANGE.0, PRINT_SPEED_RANGE.1),
            },
            Self::SetNozzleTemp { celsius } => Self::SetNozzleTemp {
                celsius: clamp_f64(*celsius, NOZZLE_RANGE),
            },
            Self::SetBedTemp { celsius } => Self::SetBedTemp {
                celsius: clamp_f64(*celsius, BED_RANGE),
            },
            other => other.clone(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RefreshStatus => "refresh-status",
            Self::RefreshAttributes => "refresh-attributes",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::SetFanSpeed { .. } => "set-fan-speed",
            Self::SetPrintSpeed { .. } => "set-print-speed",
            Self::SetNozzleTemp { .. } => "set-nozzle-temp",
            Self::SetBedTemp { .. } => "set-bed-temp",
            Self::SetLight { .. } => "set-light",
            Self::SetVideo { .. } => "set-video",
            Self::ListHistory => "list-history",
            Self::HistoryDetail { .. } => "history-detail",
        }
    }

    /// SDCP `(Cmd, Data)` pair. Call on a clamped command.
    pub fn to_sdcp(&self) -> (u32, Value) {
        match self {
            Self::RefreshStatus => (cmd::STATUS, json!({})),
            Self::RefreshAttributes => (cmd::ATTRIBUTES, json!({})),
            Self::Pause => (cmd::PAUSE_PRINT, json!({})),
            Self::Resume => (cmd::RESUME_PRINT, json!({})),
            Self::Stop => (cmd::STOP_PRINT, json!({})),
            Self::SetFanSpeed { fan, percent } => {
                let key = match fan {
                    Fan::Model => "ModelFan",
                    Fan::Auxiliary => "AuxiliaryFan",
                    Fan::Box => "BoxFan",
                };
                (
                    cmd::SET_PARAMETERS,
                    json!({ "TargetFanSpeed": { key: percent } }),
                )
            }
            Self::SetPrintSpeed { percent } => {
                (cmd::SET_PARAMETERS, json!({ "PrintSpeedPct": percent }))
            }
            Self::SetNozzleTemp { celsius } => {
                (cmd::SET_PARAMETERS, json!({ "TempTargetNozzle": celsius }))
            }
            Self::SetBedTemp { celsius } => {
                (cmd::SET_PARAMETERS, json!({ "TempTargetHotbed": celsius }))
            }
            Self::SetLight { on } => (
                cmd::SET_PARAMETERS,
                json!({ "LightStatus": { "SecondLight": on, "RgbLight": if *on { [255, 255, 255] } else { [0, 0, 0] } } }),
            ),
            Self::SetVideo { enable } => (cmd::VIDEO_STREAM, json!({ "Enable": u8::from(*enable) })),
            Self::ListHistory => (cmd::HISTORY_LIST, json!({})),
            Self::HistoryDetail { task_ids } => (cmd::HISTORY_DETAIL, json!({ "Id": task_ids })),
        }
    }

    /// Inverted-MQTT `(method, params)` pair. Call on a clamped command.
    pub fn to_cc2(&self) -> (u32, Value) {
        match self {
            Self::RefreshStatus => (method::STATUS, json!({})),
            Self::RefreshAttributes => (method::ATTRIBUTES, json!({})),
            Self::Pause => (method::PAUSE_PRINT, json!({})),
            Self::Resume => (method::RESUME_PRINT, json!({})),
            Self::Stop => (method::STOP_PRINT, json!({})),
            Self::SetFanSpeed { fan, percent } => {
                let key = match fan {
                    Fan::Model => "fan",
                    Fan::Auxiliary => "aux_fan",
                    Fan::Box => "box_fan",
                };
                (method::SET_FAN, json!({ key: percent }))
            }
            Self::SetPrintSpeed { percent } => {
                (method::SET_PRINT_SPEED, json!({ "percent": percent }))
            }
            Self::SetNozzleTemp { celsius } => {
                (method::SET_TEMPERATURE, json!({ "extruder": celsius }))
            }
            Self::SetBedTemp { celsius } => {
                (method::SET_TEMPERATURE, json!({ "heater_bed": celsius }))
            }
            Self::SetLight { on } => (method::SET_LIGHT, json!({ "power": u8::from(*on) })),
            Self::SetVideo { enable } => (method::VIDEO_STREAM, json!({ "enable": u8::from(*enable) })),
            Self::ListHistory => (method::HISTORY_LIST, json!({})),
            Self::HistoryDetail { task_ids } => (method::HISTORY_DETAIL, json!({ "id": task_ids })),
        }
    }
}
