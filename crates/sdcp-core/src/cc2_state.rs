// ── Inverted-MQTT status cache ──
//
// The printer pushes sparse deltas with a sequence number. The cache keeps
// a typed document, merges each delta group by group, and watches the
// sequence for gaps. Keys we do not model are deep-merged into `extra` so
// nothing the board reports is lost.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, trace};

/// Consecutive non-continuous deltas tolerated before a full resync.
pub const DEFAULT_RESYNC_THRESHOLD: u32 = 3;

// ── Field groups ─────────────────────────────────────────────────────

trait Merge {
    fn merge(&mut self, delta: Self);
}

/// Overwrite every scalar the delta carries.
macro_rules! merge_opt {
    ($self:ident, $delta:ident; $($field:ident),+ $(,)?) => {
        $(
            if $delta.$field.is_some() {
                $self.$field = $delta.$field;
            }
        )+
    };
}

/// Recurse into every nested group the delta carries.
macro_rules! merge_nested {
    ($self:ident, $delta:ident; $($field:ident),+ $(,)?) => {
        $(
            if let Some(inner) = $delta.$field {
                match &mut $self.$field {
                    Some(existing) => existing.merge(inner),
                    slot @ None => *slot = Some(inner),
                }
            }
        )+
    };
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_status: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

impl Merge for MachineState {
    fn merge(&mut self, delta: Self) {
        merge_opt!(self, delta; status, sub_status, progress);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrintState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_layer: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_layer: Option<u32>,
    /// Seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub print_duration: Option<f64>,
    /// Seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_time_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
}

impl Merge for PrintState {
    fn merge(&mut self, delta: Self) {
        merge_opt!(
            self, delta;
            filename, uuid, current_layer, total_layer, print_duration,
            total_duration, remaining_time_sec, state, error_code,
        );
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Heater {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<f64>,
}

impl Merge for Heater {
    fn merge(&mut self, delta: Self) {
        merge_opt!(self, delta; temperature, target);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FanState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
}

impl Merge for FanState {
    fn merge(&mut self, delta: Self) {
        merge_opt!(self, delta; speed);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fans {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan: Option<FanState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aux_fan: Option<FanState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub box_fan: Option<FanState>,
}

impl Merge for Fans {
    fn merge(&mut self, delta: Self) {
        merge_nested!(self, delta; fan, aux_fan, box_fan);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Led {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
}

impl Merge for Led {
    fn merge(&mut self, delta: Self) {
        merge_opt!(self, delta; status);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Motion {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_mode: Option<i64>,
}

impl Merge for Motion {
    fn merge(&mut self, delta: Self) {
        merge_opt!(self, delta; x, y, z, speed_mode);
    }
}

// ── Cc2StatusDoc ─────────────────────────────────────────────────────

/// Typed inverted-MQTT status document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Cc2StatusDoc {
    pub machine_status: MachineState,
    pub print_status: PrintState,
    pub extruder: Heater,
    pub heater_bed: Heater,
    pub chamber: Heater,
    pub fans: Fans,
    pub led: Led,
    pub gcode_move: Motion,
    /// Keys without a typed group, deep-merged.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Cc2StatusDoc {
    pub fn from_full(full: &Value) -> Self {
        let mut doc = Self::default();
        doc.merge_delta(full);
        doc
    }

    /// Apply one delta: typed groups merge field by field, anything else
    /// deep-merges into `extra`. A group that fails to parse is skipped.
    pub fn merge_delta(&mut self, delta: &Value) {
        let Some(object) = delta.as_object() else {
            debug!("ignoring non-object status delta");
            return;
        };
        for (key, value) in object {
            match key.as_str() {
                "machine_status" => merge_group(&mut self.machine_status, key, value),
                "print_status" => merge_group(&mut self.print_status, key, value),
                "extruder" => merge_group(&mut self.extruder, key, value),
                "heater_bed" => merge_group(&mut self.heater_bed, key, value),
                "chamber" | "ztemperature_sensor" => merge_group(&mut self.chamber, key, value),
                "fans" => merge_group(&mut self.fans, key, value),
                "led" => merge_group(&mut self.led, key, value),
                "gcode_move" => merge_group(&mut self.gcode_move, key, value),
                _ => deep_merge(
                    self.extra.entry(key.clone()).or_insert(Value::Null),
                    value,
                ),
            }
        }
    }
}

fn merge_group<G: Merge + DeserializeOwned>(slot: &mut G, key: &str, value: &Value) {
    match G::deserialize(value) {
        Ok(delta) => slot.merge(delta),
        Err(e) => debug!(group = key, error = %e, "skipping malformed status group"),
    }
}

/// Objects merge key by key; everything else is replaced.
pub fn deep_merge(target: &mut Value, delta: &Value) {
    match (target, delta) {
        (Value::Object(existing), Value::Object(patch)) => {
            for (key, value) in patch {
                deep_merge(existing.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

// ── Cc2StatusCache ───────────────────────────────────────────────────

/// What the owner has to do after a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// Merged in sequence.
    Applied,
    /// Merged, but the sequence skipped or there was no baseline.
    AppliedOutOfSequence,
    /// Older than or equal to the last merged sequence; dropped.
    Stale,
    /// Too many non-continuous deltas in a row; request a full status.
    ResyncRequired,
}

/// Cached document plus sequence bookkeeping.
#[derive(Debug, Clone)]
pub struct Cc2StatusCache {
    doc: Cc2StatusDoc,
    last_seq: Option<u64>,
    has_baseline: bool,
    non_continuity: u32,
    threshold: u32,
}

impl Default for Cc2StatusCache {
    fn default() -> Self {
        Self::new(DEFAULT_RESYNC_THRESHOLD)
    }
}

impl Cc2StatusCache {
    pub fn new(threshold: u32) -> Self {
        Self {
            doc: Cc2StatusDoc::default(),
            last_seq: None,
            has_baseline: false,
            non_continuity: 0,
            threshold: threshold.max(1),
        }
    }

    pub fn doc(&self) -> &Cc2StatusDoc {
        &self.doc
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    pub fn non_continuity(&self) -> u32 {
        self.non_continuity
    }

    /// Replace the document wholesale and restart sequence tracking.
    pub fn apply_full(&mut self, full: &Value) {
        self.doc = Cc2StatusDoc::from_full(full);
        self.last_seq = None;
        self.has_baseline = true;
        self.non_continuity = 0;
        trace!("status cache reset from full status");
    }

    pub fn apply_delta(&mut self, seq: u64, delta: &Value) -> DeltaOutcome {
        let continuous = match self.last_seq {
            Some(last) if seq <= last => {
                debug!(seq, last, "dropping stale status delta");
                return self.count_gap(DeltaOutcome::Stale);
            }
            Some(last) => seq == last + 1,
            // First delta after a full status continues from it.
            None => self.has_baseline,
        };

        self.doc.merge_delta(delta);
        self.last_seq = Some(seq);

        if continuous {
            self.non_continuity = 0;
            DeltaOutcome::Applied
        } else {
            debug!(seq, "status delta out of sequence");
            self.count_gap(DeltaOutcome::AppliedOutOfSequence)
        }
    }

    fn count_gap(&mut self, otherwise: DeltaOutcome) -> DeltaOutcome {
        self.non_continuity += 1;
        if self.non_continuity >= self.threshold {
            self.non_continuity = 0;
            DeltaOutcome::ResyncRequired
        } else {
            otherwise
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
