// ── Wire-to-domain conversions ──
//
// Bridges the loosely-typed documents `sdcp_api` hands out into the
// canonical `crate::model` types. Missing or mistyped fields fall back to
// defaults; nothing in here fails.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::cc2_state::Cc2StatusDoc;
use crate::model::{
    Attributes, FanSpeeds, LightState, MachineStatus, Position, PrintHistoryEntry, PrintJob,
    PrintStatus, PrinterClass, StatusSnapshot, Temperature, Temperatures,
};

// ── Helpers ──────────────────────────────────────────────────────────

/// Saturating float-to-integer conversion; NaN and negatives become 0.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn f64_to_u64(v: f64) -> u64 {
    if v.is_finite() && v > 0.0 {
        v.round().min(u64::MAX as f64) as u64
    } else {
        0
    }
}

fn f64_to_u32(v: f64) -> u32 {
    u32::try_from(f64_to_u64(v)).unwrap_or(u32::MAX)
}

/// Numbers arrive as ints, floats, or numeric strings depending on firmware.
fn num(value: &Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn int(value: &Value, key: &str) -> Option<i64> {
    match value.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn uint(value: &Value, key: &str) -> Option<u32> {
    num(value, key).map(f64_to_u32)
}

fn string(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

fn flag(value: &Value, key: &str) -> Option<bool> {
    match value.get(key)? {
        Value::Bool(b) => Some(*b),
        other => other.as_i64().map(|n| n != 0),
    }
}

fn epoch_to_datetime(epoch: Option<i64>) -> Option<DateTime<Utc>> {
    epoch
        .filter(|ts| *ts > 0)
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
}

fn temperature(current: Option<f64>, target: Option<f64>) -> Option<Temperature> {
    current.map(|current| Temperature { current, target })
}

/// `"x,y,z"` as reported in `CurrenCoord`.
fn parse_coord(raw: &str) -> Option<Position> {
    let mut parts = raw.split(',').map(|p| p.trim().parse::<f64>());
    let x = parts.next()?.ok()?;
    let y = parts.next()?.ok()?;
    let z = parts.next()?.ok()?;
    Some(Position { x, y, z })
}

// ── Derived job fields ───────────────────────────────────────────────

/// Fill `percent_complete` and the remaining counters.
///
/// A completed job always reads 100% with nothing remaining: boards
/// report zero layers and zero progress once the job ends.
pub fn derive_job(job: &mut PrintJob, progress: Option<f64>, reported_remaining_ms: Option<u64>) {
    if job.status == PrintStatus::Complete {
        job.current_layer = job.total_layers;
        if job.total_time_ms > 0 {
            job.current_time_ms = job.total_time_ms;
        }
        job.percent_complete = 100.0;
        job.remaining_layers = 0;
        job.remaining_time_ms = 0;
        return;
    }

    let percent = if job.total_layers > 0 {
        f64::from(job.current_layer) / f64::from(job.total_layers) * 100.0
    } else if let Some(progress) = progress.filter(|p| p.is_finite()) {
        progress
    } else if job.total_time_ms > 0 {
        #[allow(clippy::cast_precision_loss)]
        let ratio = job.current_time_ms as f64 / job.total_time_ms as f64;
        ratio * 100.0
    } else {
        0.0
    };
    job.percent_complete = percent.clamp(0.0, 100.0);
    job.remaining_layers = job.total_layers.saturating_sub(job.current_layer);
    job.remaining_time_ms = reported_remaining_ms
        .unwrap_or_else(|| job.total_time_ms.saturating_sub(job.current_time_ms));
}

// ── SDCP status ──────────────────────────────────────────────────────

/// Build a snapshot from an SDCP `Status` document.
pub fn sdcp_snapshot(status: &Value, class: PrinterClass) -> StatusSnapshot {
    let machine_statuses: Vec<MachineStatus> = match status.get("CurrentStatus") {
        Some(Value::Array(codes)) => codes
            .iter()
            .filter_map(Value::as_i64)
            .map(MachineStatus::from_code)
            .collect(),
        Some(other) => other
            .as_i64()
            .map(MachineStatus::from_code)
            .into_iter()
            .collect(),
        None => Vec::new(),
    };

    let info = status.get("PrintInfo").cloned().unwrap_or(Value::Null);
    let mut print = PrintJob {
        status: int(&info, "Status").map_or(PrintStatus::Idle, PrintStatus::from_code),
        filename: string(&info, "Filename"),
        task_id: string(&info, "TaskId"),
        current_layer: uint(&info, "CurrentLayer").unwrap_or(0),
        total_layers: uint(&info, "TotalLayer").unwrap_or(0),
        current_time_ms: num(&info, "CurrentTicks").map_or(0, |t| class.ticks_to_ms(t)),
        total_time_ms: num(&info, "TotalTicks").map_or(0, |t| class.ticks_to_ms(t)),
        error_code: int(&info, "ErrorNumber").unwrap_or(0),
        print_speed_pct: uint(&info, "PrintSpeedPct"),
        ..PrintJob::default()
    };
    derive_job(&mut print, num(&info, "Progress"), None);

    let temperatures = Temperatures {
        nozzle: temperature(
            num(status, "TempOfNozzle"),
            num(status, "TempTargetNozzle"),
        ),
        bed: temperature(num(status, "TempOfHotbed"), num(status, "TempTargetHotbed")),
        chamber: temperature(num(status, "TempOfBox"), num(status, "TempTargetBox")),
        uv_led: num(status, "TempOfUVLED"),
    };

    let fans = status
        .get("CurrentFanSpeed")
        .map(|f| FanSpeeds {
            model: uint(f, "ModelFan"),
            auxiliary: uint(f, "AuxiliaryFan"),
            chamber: uint(f, "BoxFan"),
        })
        .unwrap_or_default();

    let light = status.get("LightStatus").map(|l| LightState {
        on: flag(l, "SecondLight").unwrap_or(false),
        rgb: l.get("RgbLight").and_then(parse_rgb),
    });

    let position = status
        .get("CurrenCoord")
        .or_else(|| status.get("CurrentCoord"))
        .and_then(Value::as_str)
        .and_then(parse_coord);

    StatusSnapshot {
        machine_status: machine_statuses
            .first()
            .copied()
            .unwrap_or(MachineStatus::Idle),
        machine_statuses,
        print,
        temperatures,
        fans,
        light,
        position,
        z_offset: num(status, "ZOffset"),
        updated_at: Utc::now(),
    }
}

fn parse_rgb(value: &Value) -> Option<[u8; 3]> {
    let items = value.as_array()?;
    let mut rgb = [0u8; 3];
    for (slot, item) in rgb.iter_mut().zip(items) {
        *slot = u8::try_from(item.as_u64()?).ok()?;
    }
    (items.len() >= 3).then_some(rgb)
}

// ── SDCP attributes ──────────────────────────────────────────────────

pub fn sdcp_attributes(attributes: &Value) -> Attributes {
    Attributes {
        name: string(attributes, "Name").unwrap_or_default(),
        machine_name: string(attributes, "MachineName").unwrap_or_default(),
        brand_name: string(attributes, "BrandName"),
        mainboard_id: string(attributes, "MainboardID").unwrap_or_default(),
        mainboard_ip: string(attributes, "MainboardIP"),
        protocol_version: string(attributes, "ProtocolVersion"),
        firmware_version: string(attributes, "FirmwareVersion"),
        resolution: string(attributes, "Resolution"),
        build_volume: string(attributes, "XYZsize"),
        capabilities: string_list(attributes, "Capabilities"),
        supported_file_types: string_list(attributes, "SupportFileType"),
        video_streams_connected: uint(attributes, "NumberOfVideoStreamConnected"),
        video_streams_max: uint(attributes, "MaximumVideoStreamAllowed"),
        remaining_memory: num(attributes, "RemainingMemory").map(f64_to_u64),
        camera_connected: flag(attributes, "CameraStatus"),
        usb_disk_connected: flag(attributes, "UsbDiskStatus"),
    }
}

// ── SDCP history ─────────────────────────────────────────────────────

/// Task ids from a history-list response (`HistoryData`).
pub fn sdcp_history_ids(data: &Value) -> Vec<String> {
    string_list(data, "HistoryData")
}

/// Detailed entries from a history-detail response (`HistoryDetailList`).
pub fn sdcp_history_details(data: &Value) -> Vec<PrintHistoryEntry> {
    data.get("HistoryDetailList")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(sdcp_history_entry).collect())
        .unwrap_or_default()
}

fn sdcp_history_entry(item: &Value) -> Option<PrintHistoryEntry> {
    let task_id = string(item, "TaskId")?;
    Some(PrintHistoryEntry {
        filename: string(item, "TaskName"),
        begin_time: epoch_to_datetime(int(item, "BeginTime")),
        end_time: epoch_to_datetime(int(item, "EndTime")),
        status: int(item, "TaskStatus"),
        thumbnail_url: string(item, "Thumbnail"),
        layers_printed: uint(item, "AlreadyPrintLayer"),
        time_lapse_url: string(item, "TimeLapseVideoUrl"),
        slice_info: item
            .get("SliceInformation")
            .filter(|v| !v.is_null())
            .cloned(),
        has_detail: true,
        task_id,
    })
}

// ── Inverted-MQTT status ─────────────────────────────────────────────

/// Build a snapshot from the cached inverted-MQTT document. Times are seconds.
pub fn cc2_snapshot(doc: &Cc2StatusDoc) -> StatusSnapshot {
    let ps = &doc.print_status;
    let status = ps
        .state
        .as_deref()
        .map_or(PrintStatus::Idle, PrintStatus::from_state_name);
    let seconds_to_ms = |s: f64| f64_to_u64(s * 1000.0);

    let mut print = PrintJob {
        status,
        filename: ps.filename.clone().filter(|f| !f.is_empty()),
        task_id: ps.uuid.clone().filter(|u| !u.is_empty()),
        current_layer: ps.current_layer.unwrap_or(0),
        total_layers: ps.total_layer.unwrap_or(0),
        current_time_ms: ps.print_duration.map_or(0, seconds_to_ms),
        total_time_ms: ps.total_duration.map_or(0, seconds_to_ms),
        error_code: ps.error_code.unwrap_or(0),
        print_speed_pct: doc.gcode_move.speed_mode.map(speed_mode_pct),
        ..PrintJob::default()
    };
    derive_job(
        &mut print,
        doc.machine_status.progress,
        ps.remaining_time_sec.map(seconds_to_ms),
    );

    // Derived from the print phase only when the board omits its own code.
    let machine_status = doc.machine_status.status.map_or_else(
        || {
            if status.is_active() {
                MachineStatus::Printing
            } else {
                MachineStatus::Idle
            }
        },
        MachineStatus::from_code,
    );

    let heater = |h: &crate::cc2_state::Heater| temperature(h.temperature, h.target);
    let fan = |f: &Option<crate::cc2_state::FanState>| {
        f.as_ref().and_then(|f| f.speed).map(fan_percent)
    };

    StatusSnapshot {
        machine_status,
        machine_statuses: vec![machine_status],
        print,
        temperatures: Temperatures {
            nozzle: heater(&doc.extruder),
            bed: heater(&doc.heater_bed),
            chamber: heater(&doc.chamber),
            uv_led: None,
        },
        fans: FanSpeeds {
            model: fan(&doc.fans.fan),
            auxiliary: fan(&doc.fans.aux_fan),
            chamber: fan(&doc.fans.box_fan),
        },
        light: doc.led.status.map(|s| LightState {
            on: s != 0,
            rgb: None,
        }),
        position: match (doc.gcode_move.x, doc.gcode_move.y, doc.gcode_move.z) {
            (Some(x), Some(y), Some(z)) => Some(Position { x, y, z }),
            _ => None,
        },
        z_offset: None,
        updated_at: Utc::now(),
    }
}

/// Fan speed arrives either as 0..=255 PWM or as a percentage.
fn fan_percent(raw: f64) -> u32 {
    if raw > 100.0 {
        f64_to_u32(raw / 255.0 * 100.0).min(100)
    } else {
        f64_to_u32(raw)
    }
}

/// Speed mode index: 0 silent, 1 balanced, 2 sport, 3 ludicrous.
fn speed_mode_pct(mode: i64) -> u32 {
    match mode {
        0 => 50,
        2 => 130,
        3 => 160,
        _ => 100,
    }
}

/// Attributes from a method 1001 result.
pub fn cc2_attributes(result: &Value) -> Attributes {
    Attributes {
        name: string(result, "hostname")
            .or_else(|| string(result, "host_name"))
            .unwrap_or_default(),
        machine_name: string(result, "machine_model").unwrap_or_default(),
        brand_name: string(result, "brand"),
        mainboard_id: string(result, "sn").unwrap_or_default(),
        mainboard_ip: string(result, "ip"),
        protocol_version: string(result, "protocol_version"),
        firmware_version: string(result, "firmware_version")
            .or_else(|| string(result, "software_version")),
        resolution: None,
        build_volume: string(result, "print_size"),
        capabilities: string_list(result, "capabilities"),
        supported_file_types: string_list(result, "support_file_type"),
        video_streams_connected: None,
        video_streams_max: None,
        remaining_memory: num(result, "remaining_memory").map(f64_to_u64),
        camera_connected: result
            .get("external_device")
            .and_then(|d| flag(d, "camera")),
        usb_disk_connected: result
            .get("external_device")
            .and_then(|d| flag(d, "u_disk")),
    }
}

/// Task ids from a method 1036 result (`history_task_list: [{task_id}]` or plain ids).
pub fn cc2_history_ids(result: &Value) -> Vec<String> {
    result
        .get("history_task_list")
        .or_else(|| result.get("list"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(id) => Some(id.clone()),
                    other => string(other, "task_id"),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Detailed entries from a method 1037 result.
pub fn cc2_history_details(result: &Value) -> Vec<PrintHistoryEntry> {
    result
        .get("history_task_list")
        .or_else(|| result.get("list"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let task_id = string(item, "task_id")?;
                    Some(PrintHistoryEntry {
                        filename: string(item, "task_name"),
                        begin_time: epoch_to_datetime(int(item, "begin_time")),
                        end_time: epoch_to_datetime(int(item, "end_time")),
                        status: int(item, "task_status"),
                        thumbnail_url: string(item, "thumbnail"),
                        layers_printed: uint(item, "already_print_layer"),
                        time_lapse_url: string(item, "time_lapse_video_url"),
                        slice_info: None,
                        has_detail: true,
                        task_id,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn fdm_status(print_status: i64, current: u32, total: u32, progress: f64) -> Value {
        json!({
            "CurrentStatus": [1],
            "TempOfNozzle": 215.4, "TempTargetNozzle": 220,
            "TempOfHotbed": 59.8, "TempTargetHotbed": 60,
            "TempOfBox": 31,
            "CurrentFanSpeed": { "ModelFan": 100, "AuxiliaryFan": 0, "BoxFan": 40 },
            "LightStatus": { "SecondLight": 1, "RgbLight": [255, 128, 0] },
            "CurrenCoord": "110.50,98.00,12.40",
            "ZOffset": 0.05,
            "PrintInfo": {
                "Status": print_status, "CurrentLayer": current, "TotalLayer": total,
                "CurrentTicks": 600, "TotalTicks": 3600, "Filename": "benchy.gcode",
                "ErrorNumber": 0, "TaskId": "T-1", "Progress": progress, "PrintSpeedPct": 100
            }
        })
    }

    #[test]
    fn complete_always_reports_full_progress() {
        let snap = sdcp_snapshot(&fdm_status(9, 0, 250, 0.0), PrinterClass::Fdm);
        assert_eq!(snap.print.status, PrintStatus::Complete);
        assert_eq!(snap.print.percent_complete, 100.0);
        assert_eq!(snap.print.remaining_layers, 0);
        assert_eq!(snap.print.remaining_time_ms, 0);
        assert_eq!(snap.print.current_layer, 250);
        assert_eq!(snap.print.current_time_ms, 3_600_000);
    }

    #[test]
    fn complete_ignores_stale_counters_on_inverted_mqtt() {
        let doc = Cc2StatusDoc::from_full(&json!({
            "print_status": { "state": "completed", "current_layer": 3, "total_layer": 80,
                              "remaining_time_sec": 999 },
            "machine_status": { "progress": 4 }
        }));
        let snap = cc2_snapshot(&doc);
        assert_eq!(snap.print.percent_complete, 100.0);
        assert_eq!(snap.print.remaining_layers, 0);
        assert_eq!(snap.print.remaining_time_ms, 0);
    }

    #[test]
    fn fdm_status_maps_every_group() {
        let snap = sdcp_snapshot(&fdm_status(13, 50, 200, 25.0), PrinterClass::Fdm);

        assert_eq!(snap.machine_status, MachineStatus::Printing);
        assert_eq!(snap.print.status, PrintStatus::Printing);
        assert_eq!(snap.print.percent_complete, 25.0);
        assert_eq!(snap.print.remaining_layers, 150);
        assert_eq!(snap.print.current_time_ms, 600_000);
        assert_eq!(snap.print.remaining_time_ms, 3_000_000);
        assert_eq!(snap.print.filename.as_deref(), Some("benchy.gcode"));
        assert_eq!(snap.print.task_id.as_deref(), Some("T-1"));
        assert_eq!(
            snap.temperatures.nozzle,
            Some(Temperature { current: 215.4, target: Some(220.0) })
        );
        assert_eq!(snap.temperatures.chamber.unwrap().target, None);
        assert_eq!(snap.fans.chamber, Some(40));
        assert_eq!(snap.light, Some(LightState { on: true, rgb: Some([255, 128, 0]) }));
        assert_eq!(snap.position.unwrap().z, 12.4);
        assert_eq!(snap.z_offset, Some(0.05));
    }

    #[test]
    fn resin_ticks_are_already_milliseconds() {
        let status = json!({
            "CurrentStatus": 1,
            "TempOfUVLED": 33.5,
            "PrintInfo": { "Status": 3, "CurrentLayer": 10, "TotalLayer": 0,
                           "CurrentTicks": 1500, "TotalTicks": 6000 }
        });
        let snap = sdcp_snapshot(&status, PrinterClass::Resin);
        assert_eq!(snap.print.current_time_ms, 1500);
        assert_eq!(snap.print.percent_complete, 25.0, "falls back to the time ratio");
        assert_eq!(snap.temperatures.uv_led, Some(33.5));
        assert_eq!(snap.machine_statuses, vec![MachineStatus::Printing]);
    }

    #[test]
    fn empty_status_is_idle_not_an_error() {
        let snap = sdcp_snapshot(&Value::Null, PrinterClass::Fdm);
        assert_eq!(snap.machine_status, MachineStatus::Idle);
        assert_eq!(snap.print, PrintJob::default());
        assert!(snap.light.is_none());
    }

    #[test]
    fn attributes_map_capabilities_and_counts() {
        let attrs = sdcp_attributes(&json!({
            "Name": "Carbon", "MachineName": "Centauri Carbon", "BrandName": "ELEGOO",
            "MainboardID": "MB1", "MainboardIP": "10.0.0.5", "FirmwareVersion": "V1.1.29",
            "Capabilities": ["FILE_TRANSFER", "PRINT_CONTROL", "VIDEO_STREAM"],
            "NumberOfVideoStreamConnected": 1, "MaximumVideoStreamAllowed": 1,
            "RemainingMemory": 5_000_000_000_u64, "CameraStatus": 1, "UsbDiskStatus": 0
        }));
        assert!(attrs.supports("video_stream"));
        assert_eq!(attrs.remaining_memory, Some(5_000_000_000));
        assert_eq!(attrs.camera_connected, Some(true));
        assert_eq!(attrs.usb_disk_connected, Some(false));
    }

    #[test]
    fn history_detail_parses_and_skips_entries_without_id() {
        let entries = sdcp_history_details(&json!({
            "Ack": 0,
            "HistoryDetailList": [
                { "TaskId": "A", "TaskName": "cube.gcode", "BeginTime": 1_700_000_000,
                  "EndTime": 1_700_003_600, "TaskStatus": 9, "Thumbnail": "http://10.0.0.5/t.png",
                  "SliceInformation": { "LayerHeight": 0.2 } },
                { "TaskName": "orphan" }
            ]
        }));
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert!(entry.has_detail);
        assert_eq!(entry.duration(), Some(chrono::Duration::hours(1)));
        assert_eq!(entry.slice_info, Some(json!({ "LayerHeight": 0.2 })));
    }

    #[test]
    fn cc2_seconds_become_milliseconds() {
        let doc = Cc2StatusDoc::from_full(&json!({
            "print_status": { "state": "printing", "current_layer": 20, "total_layer": 100,
                              "print_duration": 120, "total_duration": 600, "remaining_time_sec": 480 },
            "extruder": { "temperature": 210.0, "target": 210.0 },
            "fans": { "fan": { "speed": 255.0 } },
            "gcode_move": { "speed_mode": 2 }
        }));
        let snap = cc2_snapshot(&doc);
        assert_eq!(snap.print.current_time_ms, 120_000);
        assert_eq!(snap.print.remaining_time_ms, 480_000);
        assert_eq!(snap.print.percent_complete, 20.0);
        assert_eq!(snap.print.print_speed_pct, Some(130));
        assert_eq!(snap.fans.model, Some(100));
        assert_eq!(snap.machine_status, MachineStatus::Printing);
    }

    #[test]
    fn cc2_reported_machine_status_wins_over_derivation() {
        let doc = Cc2StatusDoc::from_full(&json!({
            "print_status": { "state": "standby" },
            "machine_status": { "status": 2 }
        }));
        let snap = cc2_snapshot(&doc);
        assert_eq!(snap.print.status, PrintStatus::Idle);
        assert_eq!(snap.machine_status, MachineStatus::FileTransferring);
        assert_eq!(snap.machine_statuses, vec![MachineStatus::FileTransferring]);

        let doc = Cc2StatusDoc::from_full(&json!({
            "print_status": { "state": "printing" },
            "machine_status": { "status": 7 }
        }));
        assert_eq!(cc2_snapshot(&doc).machine_status, MachineStatus::Unknown(7));
    }

    #[test]
    fn f64_to_u64_saturates() {
        assert_eq!(f64_to_u64(f64::NAN), 0);
        assert_eq!(f64_to_u64(-3.0), 0);
        assert_eq!(f64_to_u64(2.6), 3);
    }
}
