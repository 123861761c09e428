// ── Domain model ──
//
// Transport-agnostic printer types. Everything a consumer sees is one of
// these; wire shapes stay in `sdcp-api` and are translated by `convert`.

pub mod attributes;
pub mod device;
pub mod history;
pub mod status;

pub use attributes::Attributes;
pub use device::{Device, PrinterClass, TransportKind};
pub use history::PrintHistoryEntry;
pub use status::{
    FanSpeeds, LightState, MachineStatus, Position, PrintJob, PrintStatus, StatusSnapshot,
    Temperature, Temperatures,
};
