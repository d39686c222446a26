//! Engine configuration
//!
//! Every field has a default, so a partial TOML file (or none at all)
//! yields a working gateway:
//!
//! ```toml
//! local_logical_address = 0x0100
//! ecu_id = 0x0091
//!
//! [routing]
//! alive_check_interval_ms = 5000
//!
//! [transfer]
//! max_block_length = 1024
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sw_package::ecu_id;
use crate::telemetry::{EcuHealthRecord, EcuReadinessRecord, EcuVciRecord, HealthStatus, TEMPERATURE_OFFSET};
use crate::transfer::TransferLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// DoIP logical address of this gateway
    #[serde(default = "default_local_logical_address")]
    pub local_logical_address: u16,

    /// Identity used to decide whether a software package is for this ECU
    #[serde(default = "default_ecu_id")]
    pub ecu_id: u16,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub doip: DoipConfig,

    #[serde(default)]
    pub transfer: TransferConfig,

    /// Records this gateway reports about itself
    #[serde(default)]
    pub identity: IdentityConfig,
}

fn default_local_logical_address() -> u16 {
    0x0100
}

fn default_ecu_id() -> u16 {
    ecu_id::ZGW
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_logical_address: default_local_logical_address(),
            ecu_id: default_ecu_id(),
            routing: RoutingConfig::default(),
            doip: DoipConfig::default(),
            transfer: TransferConfig::default(),
            identity: IdentityConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer.max_block_length == 0 {
            return Err(ConfigError::Invalid(
                "transfer.max_block_length must be > 0".to_string(),
            ));
        }
        if self.routing.alive_check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "routing.alive_check_interval_ms must be > 0".to_string(),
            ));
        }
        if self.transfer.flash_size == 0 {
            return Err(ConfigError::Invalid(
                "transfer.flash_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Routing Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_alive_check_interval_ms")]
    pub alive_check_interval_ms: u64,

    /// How long the peer has to answer an alive check (0 = never expire)
    #[serde(default = "default_alive_check_timeout_ms")]
    pub alive_check_timeout_ms: u64,
}

fn default_alive_check_interval_ms() -> u64 {
    5000
}

fn default_alive_check_timeout_ms() -> u64 {
    500
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            alive_check_interval_ms: default_alive_check_interval_ms(),
            alive_check_timeout_ms: default_alive_check_timeout_ms(),
        }
    }
}

impl RoutingConfig {
    pub fn alive_check_interval(&self) -> Duration {
        Duration::from_millis(self.alive_check_interval_ms)
    }

    pub fn alive_check_timeout(&self) -> Option<Duration> {
        (self.alive_check_timeout_ms > 0).then(|| Duration::from_millis(self.alive_check_timeout_ms))
    }
}

// =============================================================================
// DoIP Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoipConfig {
    /// Frames declaring a larger payload are a framing error
    #[serde(default = "default_max_payload_length")]
    pub max_payload_length: u32,

    /// Send a DiagnosticMessageAck (0x8002) before each UDS response
    #[serde(default = "default_send_diagnostic_ack")]
    pub send_diagnostic_ack: bool,
}

fn default_max_payload_length() -> u32 {
    crate::doip::DEFAULT_MAX_PAYLOAD_LENGTH
}

fn default_send_diagnostic_ack() -> bool {
    true
}

impl Default for DoipConfig {
    fn default() -> Self {
        Self {
            max_payload_length: default_max_payload_length(),
            send_diagnostic_ack: default_send_diagnostic_ack(),
        }
    }
}

// =============================================================================
// Transfer Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// maxNumberOfBlockLength returned by RequestDownload
    #[serde(default = "default_max_block_length")]
    pub max_block_length: u16,

    /// Start of the downloadable address window
    #[serde(default)]
    pub flash_base: u32,

    /// Size of the downloadable address window (64 MB SPI flash)
    #[serde(default = "default_flash_size")]
    pub flash_size: u32,

    /// Inspect and verify the software package header during download
    #[serde(default = "default_verify_package")]
    pub verify_package: bool,
}

fn default_max_block_length() -> u16 {
    1024
}

fn default_flash_size() -> u32 {
    0x0400_0000
}

fn default_verify_package() -> bool {
    true
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_block_length: default_max_block_length(),
            flash_base: 0,
            flash_size: default_flash_size(),
            verify_package: default_verify_package(),
        }
    }
}

impl TransferConfig {
    pub fn limits(&self) -> TransferLimits {
        TransferLimits {
            max_block_length: self.max_block_length,
            flash_base: self.flash_base,
            flash_size: self.flash_size,
        }
    }
}

// =============================================================================
// Identity Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IdentityConfig {
    #[serde(default)]
    pub vci: VciIdentity,

    #[serde(default)]
    pub health: HealthIdentity,

    #[serde(default)]
    pub readiness: ReadinessIdentity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VciIdentity {
    #[serde(default = "default_identity_ecu_id")]
    pub ecu_id: String,
    #[serde(default = "default_sw_version")]
    pub sw_version: String,
    #[serde(default = "default_hw_version")]
    pub hw_version: String,
    #[serde(default = "default_serial")]
    pub serial: String,
}

fn default_identity_ecu_id() -> String {
    "ECU_091".to_string()
}

fn default_sw_version() -> String {
    "1.0.0".to_string()
}

fn default_hw_version() -> String {
    "TC375".to_string()
}

fn default_serial() -> String {
    "ZGW-0000000001".to_string()
}

impl Default for VciIdentity {
    fn default() -> Self {
        Self {
            ecu_id: default_identity_ecu_id(),
            sw_version: default_sw_version(),
            hw_version: default_hw_version(),
            serial: default_serial(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthIdentity {
    /// 0 OK, 1 WARNING, 2 ERROR, 3 CRITICAL
    #[serde(default)]
    pub status: u8,
    #[serde(default)]
    pub dtc_count: u8,
    #[serde(default = "default_battery_mv")]
    pub battery_mv: u16,
    #[serde(default = "default_temperature_c")]
    pub temperature_c: i16,
}

fn default_battery_mv() -> u16 {
    12_600
}

fn default_temperature_c() -> i16 {
    25
}

impl Default for HealthIdentity {
    fn default() -> Self {
        Self {
            status: 0,
            dtc_count: 0,
            battery_mv: default_battery_mv(),
            temperature_c: default_temperature_c(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessIdentity {
    #[serde(default = "default_true")]
    pub vehicle_parked: bool,
    #[serde(default = "default_true")]
    pub engine_off: bool,
    #[serde(default = "default_available_memory_kb")]
    pub available_memory_kb: u32,
    #[serde(default = "default_true")]
    pub all_doors_closed: bool,
    #[serde(default = "default_true")]
    pub compatible: bool,
}

fn default_true() -> bool {
    true
}

fn default_available_memory_kb() -> u32 {
    4096
}

impl Default for ReadinessIdentity {
    fn default() -> Self {
        Self {
            vehicle_parked: true,
            engine_off: true,
            available_memory_kb: default_available_memory_kb(),
            all_doors_closed: true,
            compatible: true,
        }
    }
}

impl IdentityConfig {
    pub fn vci_record(&self) -> EcuVciRecord {
        EcuVciRecord {
            ecu_id: self.vci.ecu_id.clone(),
            sw_version: self.vci.sw_version.clone(),
            hw_version: self.vci.hw_version.clone(),
            serial: self.vci.serial.clone(),
        }
    }

    pub fn health_record(&self) -> EcuHealthRecord {
        let raw = (self.health.temperature_c + TEMPERATURE_OFFSET).clamp(0, u8::MAX as i16);
        EcuHealthRecord {
            ecu_id: self.vci.ecu_id.clone(),
            status: HealthStatus::from(self.health.status),
            dtc_count: self.health.dtc_count,
            battery_mv: self.health.battery_mv,
            temperature_raw: raw as u8,
        }
    }

    /// Ready when every precondition holds
    pub fn readiness_record(&self) -> EcuReadinessRecord {
        let r = &self.readiness;
        EcuReadinessRecord {
            ecu_id: self.vci.ecu_id.clone(),
            vehicle_parked: r.vehicle_parked,
            engine_off: r.engine_off,
            battery_mv: self.health.battery_mv,
            available_memory_kb: r.available_memory_kb,
            all_doors_closed: r.all_doors_closed,
            compatible: r.compatible,
            ready_for_update: r.vehicle_parked && r.engine_off && r.all_doors_closed && r.compatible,
        }
    }
}
