// ── SDCP command identifiers ──
//
// Numeric `Cmd` values carried in `Data.Cmd` of a request envelope.

/// Ask the printer to push a fresh status document.
pub const STATUS: u32 = 0;
/// Ask the printer to push its attributes document.
pub const ATTRIBUTES: u32 = 1;
pub const PAUSE_PRINT: u32 = 129;
pub const STOP_PRINT: u32 = 130;
pub const RESUME_PRINT: u32 = 131;
/// Reply carries `HistoryData: [task ids]`.
pub const HISTORY_LIST: u32 = 320;
/// Request carries `Id: [task ids]`, reply carries `HistoryDetailList`.
pub const HISTORY_DETAIL: u32 = 321;
/// Request carries `Enable: 0|1`, reply carries `VideoUrl`.
pub const VIDEO_STREAM: u32 = 386;
/// Temperatures, fan speeds, print speed and light in one request.
pub const SET_PARAMETERS: u32 = 403;
/// Status push period in milliseconds (`TimePeriod`). Broker-mediated MQTT only.
pub const STATUS_PERIOD: u32 = 512;

/// Human-readable label for log lines.
pub fn name(cmd: u32) -> &'static str {
    match cmd {
        STATUS => "status",
        ATTRIBUTES => "attributes",
        PAUSE_PRINT => "pause",
        STOP_PRINT => "stop",
        RESUME_PRINT => "resume",
        HISTORY_LIST => "history-list",
        HISTORY_DETAIL => "history-detail",
        VIDEO_STREAM => "video",
        SET_PARAMETERS => "set-parameters",
        STATUS_PERIOD => "status-period",
        _ => "unknown",
    }
}
