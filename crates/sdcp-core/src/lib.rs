//! Domain layer between `sdcp-api` and consumers (CLI / gateway).
//!
//! - **[`Printer`]**: facade over one printer connection.
//!   [`connect()`](Printer::connect) opens a transport session, spawns a
//!   bridge that folds pushes into the [`PrinterStore`], and requests the
//!   initial status and attributes. [`Printer::execute`] runs typed
//!   [`Command`]s against whichever transport the printer speaks.
//!
//! - **[`PrinterStore`]**: `watch`-backed status and attributes snapshots,
//!   a `DashMap` history collection with backfill de-duplication, and the
//!   last video URL.
//!
//! - **Status reconstruction** ([`convert`], [`cc2_state`]): SDCP documents
//!   are replaced wholesale; inverted-MQTT deltas are merged group by group
//!   into a typed cache with sequence-gap detection and resync.
//!
//! - **Domain model** ([`model`]): `Device`, `StatusSnapshot`, `PrintJob`,
//!   `Attributes`, `PrintHistoryEntry`.

pub mod cc2_state;
pub mod command;
pub mod config;
pub mod convert;
pub mod error;
pub mod model;
pub mod printer;
pub mod store;
pub mod stream;

// ── Primary re-exports ──────────────────────────────────────────────
pub use command::{Command, CommandResult, Fan};
pub use config::PrinterConfig;
pub use error::CoreError;
pub use printer::{ConnectionState, Printer};
pub use store::PrinterStore;
pub use stream::{StatusStream, StatusWatchStream};

pub use model::{
    Attributes, Device, FanSpeeds, LightState, MachineStatus, Position, PrintHistoryEntry,
    PrintJob, PrintStatus, PrinterClass, StatusSnapshot, Temperature, Temperatures,
    TransportKind,
};
