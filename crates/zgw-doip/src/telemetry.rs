//! Telemetry report records (VCI, health, readiness)
//!
//! Every report payload is a one-byte record count followed by that many
//! fixed-stride records. A payload that ends early is not an error: the
//! records decoded so far are returned with `truncated` set.

use thiserror::Error;
use tracing::warn;

pub const VCI_RECORD_LEN: usize = 48;
pub const HEALTH_RECORD_LEN: usize = 24;
pub const READINESS_RECORD_LEN: usize = 27;

const ECU_ID_LEN: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("Empty {kind} report")]
    Empty { kind: &'static str },
}

/// A fixed-stride record inside a report payload
pub trait TelemetryRecord: Sized {
    const LEN: usize;
    const KIND: &'static str;

    /// Decode from exactly `Self::LEN` bytes
    fn decode(bytes: &[u8]) -> Self;

    fn encode(&self) -> Vec<u8>;

    fn ecu_id(&self) -> &str;
}

/// Records recovered from one report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReport<T> {
    pub declared_count: u8,
    pub records: Vec<T>,
    pub truncated: bool,
}

/// Fixed-width ASCII: trailing NULs stripped, non-ASCII bytes dropped
fn read_ascii(bytes: &[u8]) -> String {
    let text: String = bytes
        .iter()
        .filter(|b| b.is_ascii())
        .map(|&b| b as char)
        .collect();
    text.trim_end_matches('\0').to_string()
}

fn write_ascii(out: &mut Vec<u8>, value: &str, width: usize) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(width);
    out.extend_from_slice(&bytes[..n]);
    out.resize(out.len() + (width - n), 0);
}

// =============================================================================
// VCI (Vehicle Configuration Information)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EcuVciRecord {
    pub ecu_id: String,
    pub sw_version: String,
    pub hw_version: String,
    pub serial: String,
}

impl TelemetryRecord for EcuVciRecord {
    const LEN: usize = VCI_RECORD_LEN;
    const KIND: &'static str = "VCI";

    fn decode(bytes: &[u8]) -> Self {
        Self {
            ecu_id: read_ascii(&bytes[0..16]),
            sw_version: read_ascii(&bytes[16..24]),
            hw_version: read_ascii(&bytes[24..32]),
            serial: read_ascii(&bytes[32..48]),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        write_ascii(&mut out, &self.ecu_id, ECU_ID_LEN);
        write_ascii(&mut out, &self.sw_version, 8);
        write_ascii(&mut out, &self.hw_version, 8);
        write_ascii(&mut out, &self.serial, 16);
        out
    }

    fn ecu_id(&self) -> &str {
        &self.ecu_id
    }
}

// =============================================================================
// Health status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthStatus {
    #[default]
    Ok,
    Warning,
    Error,
    Critical,
    Unknown(u8),
}

impl From<u8> for HealthStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::Warning,
            2 => Self::Error,
            3 => Self::Critical,
            other => Self::Unknown(other),
        }
    }
}

impl From<HealthStatus> for u8 {
    fn from(status: HealthStatus) -> Self {
        match status {
            HealthStatus::Ok => 0,
            HealthStatus::Warning => 1,
            HealthStatus::Error => 2,
            HealthStatus::Critical => 3,
            HealthStatus::Unknown(v) => v,
        }
    }
}

/// Temperature is carried as `°C + 40`
pub const TEMPERATURE_OFFSET: i16 = 40;

/// ecu_id(16) status(1) dtc_count(1) battery_mv(2 BE) temperature(1) reserved(3)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EcuHealthRecord {
    pub ecu_id: String,
    pub status: HealthStatus,
    pub dtc_count: u8,
    pub battery_mv: u16,
    pub temperature_raw: u8,
}

impl EcuHealthRecord {
    pub fn temperature_celsius(&self) -> i16 {
        self.temperature_raw as i16 - TEMPERATURE_OFFSET
    }
}

impl TelemetryRecord for EcuHealthRecord {
    const LEN: usize = HEALTH_RECORD_LEN;
    const KIND: &'static str = "health";

    fn decode(bytes: &[u8]) -> Self {
        Self {
            ecu_id: read_ascii(&bytes[0..16]),
            status: HealthStatus::from(bytes[16]),
            dtc_count: bytes[17],
            battery_mv: u16::from_be_bytes([bytes[18], bytes[19]]),
            temperature_raw: bytes[20],
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        write_ascii(&mut out, &self.ecu_id, ECU_ID_LEN);
        out.push(self.status.into());
        out.push(self.dtc_count);
        out.extend_from_slice(&self.battery_mv.to_be_bytes());
        out.push(self.temperature_raw);
        out.extend_from_slice(&[0; 3]);
        out
    }

    fn ecu_id(&self) -> &str {
        &self.ecu_id
    }
}

// =============================================================================
// Update readiness
// =============================================================================

/// ecu_id(16) parked(1) engine_off(1) battery_mv(2 BE) memory_kb(4 BE)
/// doors_closed(1) compatible(1) ready(1)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EcuReadinessRecord {
    pub ecu_id: String,
    pub vehicle_parked: bool,
    pub engine_off: bool,
    pub battery_mv: u16,
    pub available_memory_kb: u32,
    pub all_doors_closed: bool,
    pub compatible: bool,
    pub ready_for_update: bool,
}

impl TelemetryRecord for EcuReadinessRecord {
    const LEN: usize = READINESS_RECORD_LEN;
    const KIND: &'static str = "readiness";

    fn decode(bytes: &[u8]) -> Self {
        Self {
            ecu_id: read_ascii(&bytes[0..16]),
            vehicle_parked: bytes[16] != 0,
            engine_off: bytes[17] != 0,
            battery_mv: u16::from_be_bytes([bytes[18], bytes[19]]),
            available_memory_kb: u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]),
            all_doors_closed: bytes[24] != 0,
            compatible: bytes[25] != 0,
            ready_for_update: bytes[26] != 0,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        write_ascii(&mut out, &self.ecu_id, ECU_ID_LEN);
        out.push(self.vehicle_parked as u8);
        out.push(self.engine_off as u8);
        out.extend_from_slice(&self.battery_mv.to_be_bytes());
        out.extend_from_slice(&self.available_memory_kb.to_be_bytes());
        out.push(self.all_doors_closed as u8);
        out.push(self.compatible as u8);
        out.push(self.ready_for_update as u8);
        out
    }

    fn ecu_id(&self) -> &str {
        &self.ecu_id
    }
}

// =============================================================================
// Parsing
// =============================================================================

pub fn parse_records<R: TelemetryRecord>(payload: &[u8]) -> Result<ParsedReport<R>, TelemetryError> {
    let (&declared_count, body) = payload
        .split_first()
        .ok_or(TelemetryError::Empty { kind: R::KIND })?;

    let mut records = Vec::with_capacity(declared_count as usize);
    let mut truncated = false;
    for (index, chunk) in body.chunks(R::LEN).take(declared_count as usize).enumerate() {
        if chunk.len() < R::LEN {
            warn!(
                kind = R::KIND,
                index,
                declared_count,
                remaining = chunk.len(),
                "Incomplete record data"
            );
            truncated = true;
            break;
        }
        records.push(R::decode(chunk));
    }
    if !truncated && records.len() < declared_count as usize {
        warn!(
            kind = R::KIND,
            declared_count,
            decoded = records.len(),
            "Report ended before declared record count"
        );
        truncated = true;
    }

    Ok(ParsedReport {
        declared_count,
        records,
        truncated,
    })
}

pub fn parse_vci(payload: &[u8]) -> Result<ParsedReport<EcuVciRecord>, TelemetryError> {
    parse_records(payload)
}

pub fn parse_health(payload: &[u8]) -> Result<ParsedReport<EcuHealthRecord>, TelemetryError> {
    parse_records(payload)
}

pub fn parse_readiness(payload: &[u8]) -> Result<ParsedReport<EcuReadinessRecord>, TelemetryError> {
    parse_records(payload)
}

/// Count byte followed by the records; at most 255 records are written
pub fn encode_report<R: TelemetryRecord>(records: &[R]) -> Vec<u8> {
    let count = records.len().min(u8::MAX as usize);
    let mut out = Vec::with_capacity(1 + count * R::LEN);
    out.push(count as u8);
    for record in &records[..count] {
        out.extend(record.encode());
    }
    out
}

// =============================================================================
// Per-session store
// =============================================================================

/// Records reported by peers during the current connection
#[derive(Debug, Default, Clone)]
pub struct TelemetryStore {
    pub vci: Vec<EcuVciRecord>,
    pub health: Vec<EcuHealthRecord>,
    pub readiness: Vec<EcuReadinessRecord>,
}

/// Collected records kept per kind: one count byte minus the gateway's own record
pub const MAX_COLLECTED_RECORDS: usize = u8::MAX as usize - 1;

fn merge<R: TelemetryRecord + Clone>(into: &mut Vec<R>, records: &[R]) {
    let mut dropped = 0usize;
    for record in records {
        let len = into.len();
        match into.iter_mut().find(|r| r.ecu_id() == record.ecu_id()) {
            Some(existing) => *existing = record.clone(),
            None if len < MAX_COLLECTED_RECORDS => into.push(record.clone()),
            None => dropped += 1,
        }
    }
    if dropped > 0 {
        warn!(
            kind = R::KIND,
            dropped,
            stored = into.len(),
            "Telemetry store full, dropping records for new ECUs"
        );
    }
}

impl TelemetryStore {
    pub fn merge_vci(&mut self, records: &[EcuVciRecord]) {
        merge(&mut self.vci, records);
    }

    pub fn merge_health(&mut self, records: &[EcuHealthRecord]) {
        merge(&mut self.health, records);
    }

    pub fn merge_readiness(&mut self, records: &[EcuReadinessRecord]) {
        merge(&mut self.readiness, records);
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
