//! Simulation-wide configuration.
//!
//! Loaded once from TOML and shared read-only by every device. All fields
//! have defaults, so an empty document is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{DevSimError, Result};

/// Default values.
pub mod defaults {
    pub const FIRMWARE_MS: u64 = 30_000;
    pub const CONNECT_MS: u64 = 5_000;
    pub const RESTART_MIN_HOURS: u64 = 1;
    pub const RESTART_MAX_HOURS: u64 = 3;
    pub const SAS_EXPIRE_HOURS: u64 = 168;
    pub const DPS_RETRIES: u32 = 10;
    pub const METHOD_DRAIN_MS: u64 = 2_000;
    pub const TRANSPORT_STOP_MS: u64 = 5_000;
    pub const EDGE_STATUS_MS: u64 = 30_000;
    pub const PLAN_START_DELAY_MS: i64 = 2_000;
    pub const PLAN_TIMELINE_DELAY_MS: i64 = 5_000;
    pub const GLOBAL_DPS_ENDPOINT: &str = "global.azure-devices-provisioning.net";
    pub const CMD_SHUTDOWN: &str = "shutdown";
    pub const CMD_REBOOT: &str = "reboot";
    pub const CMD_FIRMWARE: &str = "firmware";
}

/// Environment variable names.
pub mod env_vars {
    pub const DPS_RETRIES: &str = "NEOMIND_DEVSIM_DPS_RETRIES";
    pub const CONNECT_MS: &str = "NEOMIND_DEVSIM_CONNECT_MS";
    pub const SAS_MODE: &str = "NEOMIND_DEVSIM_SAS_MODE";

    /// DPS retry count from the environment, if set and valid.
    pub fn dps_retries() -> Option<u32> {
        std::env::var(DPS_RETRIES).ok().and_then(|s| s.parse().ok())
    }

    /// DPS poll interval from the environment, if set and valid.
    pub fn connect_ms() -> Option<u64> {
        std::env::var(CONNECT_MS).ok().and_then(|s| s.parse().ok())
    }

    /// SAS mode from the environment, if set and valid.
    pub fn sas_mode() -> Option<bool> {
        std::env::var(SAS_MODE).ok().and_then(|s| s.parse().ok())
    }
}

/// Inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range<T> {
    pub min: T,
    pub max: T,
}

impl<T: PartialOrd + Copy + std::fmt::Display> Range<T> {
    pub fn new(min: T, max: T) -> Self {
        Self { min, max }
    }

    fn check(&self, name: &str) -> Result<()> {
        if self.min > self.max {
            return Err(DevSimError::Configuration(format!(
                "{} range is inverted: min {} > max {}",
                name, self.min, self.max
            )));
        }
        Ok(())
    }
}

/// Device lifecycle timings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSection {
    /// Delay before a firmware command restarts the device.
    #[serde(default = "default_firmware_ms")]
    pub firmware_ms: u64,

    /// DPS registration poll interval.
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,

    /// Forced-reconnect window in hours.
    #[serde(default = "default_restart")]
    pub restart: Range<u64>,

    /// SAS token lifetime in hours.
    #[serde(default = "default_sas_expire_hours")]
    pub sas_expire_hours: u64,

    /// Registration attempts before giving up.
    #[serde(default = "default_dps_retries")]
    pub dps_retries: u32,

    /// Build a SAS credential instead of passing the raw connection string.
    #[serde(default = "default_true")]
    pub sas_mode: bool,

    /// Delay between a method response and built-in command handling.
    #[serde(default = "default_method_drain_ms")]
    pub method_drain_ms: u64,

    /// Delay before stopping after a transport failure.
    #[serde(default = "default_transport_stop_ms")]
    pub transport_stop_ms: u64,

    /// Edge module status report interval.
    #[serde(default = "default_edge_status_ms")]
    pub edge_status_ms: u64,
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            firmware_ms: default_firmware_ms(),
            connect_ms: default_connect_ms(),
            restart: default_restart(),
            sas_expire_hours: default_sas_expire_hours(),
            dps_retries: default_dps_retries(),
            sas_mode: true,
            method_drain_ms: default_method_drain_ms(),
            transport_stop_ms: default_transport_stop_ms(),
            edge_status_ms: default_edge_status_ms(),
        }
    }
}

/// Shared runloop periods used by properties with `override` set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunloopSection {
    #[serde(default = "default_secs")]
    pub secs: Range<u64>,
    #[serde(default = "default_mins")]
    pub mins: Range<u64>,
}

impl Default for RunloopSection {
    fn default() -> Self {
        Self {
            secs: default_secs(),
            mins: default_mins(),
        }
    }
}

/// Plan mode delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSection {
    #[serde(default = "default_plan_start_delay_ms")]
    pub start_delay_ms: i64,
    #[serde(default = "default_plan_timeline_delay_ms")]
    pub timeline_delay_ms: i64,
}

impl Default for PlanSection {
    fn default() -> Self {
        Self {
            start_delay_ms: default_plan_start_delay_ms(),
            timeline_delay_ms: default_plan_timeline_delay_ms(),
        }
    }
}

/// Built-in device-control command names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandsSection {
    #[serde(default = "default_cmd_shutdown")]
    pub shutdown: String,
    #[serde(default = "default_cmd_reboot")]
    pub reboot: String,
    #[serde(default = "default_cmd_firmware")]
    pub firmware: String,
}

impl Default for CommandsSection {
    fn default() -> Self {
        Self {
            shutdown: default_cmd_shutdown(),
            reboot: default_cmd_reboot(),
            firmware: default_cmd_firmware(),
        }
    }
}

/// Macro value ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangesSection {
    #[serde(default = "default_integer_range")]
    pub integer: Range<i64>,
    #[serde(default = "default_double_range")]
    pub double: Range<f64>,
    #[serde(default = "default_vector_range")]
    pub vector: Range<f64>,
}

impl Default for RangesSection {
    fn default() -> Self {
        Self {
            integer: default_integer_range(),
            double: default_double_range(),
            vector: default_vector_range(),
        }
    }
}

/// A geographic area for `AUTO_GEOPOINT`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoArea {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: f64,
    /// Radius in meters.
    #[serde(default = "default_radius")]
    pub radius: f64,
}

impl Default for GeoArea {
    fn default() -> Self {
        Self {
            latitude: 47.6062,
            longitude: -122.3321,
            altitude: 0.0,
            radius: default_radius(),
        }
    }
}

/// Provisioning service settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningSection {
    #[serde(default = "default_global_endpoint")]
    pub global_endpoint: String,
}

impl Default for ProvisioningSection {
    fn default() -> Self {
        Self {
            global_endpoint: default_global_endpoint(),
        }
    }
}

/// Complete simulation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub simulation: SimulationSection,
    #[serde(default)]
    pub runloop: RunloopSection,
    #[serde(default)]
    pub plan: PlanSection,
    #[serde(default)]
    pub commands: CommandsSection,
    #[serde(default)]
    pub ranges: RangesSection,
    #[serde(default = "default_geo")]
    pub geo: Vec<GeoArea>,
    #[serde(default)]
    pub provisioning: ProvisioningSection,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            simulation: SimulationSection::default(),
            runloop: RunloopSection::default(),
            plan: PlanSection::default(),
            commands: CommandsSection::default(),
            ranges: RangesSection::default(),
            geo: default_geo(),
            provisioning: ProvisioningSection::default(),
        }
    }
}

impl SimulationConfig {
    /// Parse from a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let mut config: SimulationConfig = toml::from_str(text)
            .map_err(|e| DevSimError::Configuration(format!("Invalid TOML: {}", e)))?;
        if config.geo.is_empty() {
            config.geo = default_geo();
        }
        Ok(config)
    }

    /// Load from a TOML file, then apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DevSimError::Configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&text)?.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `NEOMIND_DEVSIM_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(retries) = env_vars::dps_retries() {
            self.simulation.dps_retries = retries;
        }
        if let Some(connect_ms) = env_vars::connect_ms() {
            self.simulation.connect_ms = connect_ms;
        }
        if let Some(sas_mode) = env_vars::sas_mode() {
            self.simulation.sas_mode = sas_mode;
        }
        self
    }

    /// Reject inverted ranges, zero intervals and empty geo lists.
    pub fn validate(&self) -> Result<()> {
        self.simulation.restart.check("simulation.restart")?;
        self.runloop.secs.check("runloop.secs")?;
        self.runloop.mins.check("runloop.mins")?;
        self.ranges.integer.check("ranges.integer")?;
        self.ranges.double.check("ranges.double")?;
        self.ranges.vector.check("ranges.vector")?;

        if self.simulation.connect_ms == 0 {
            return Err(DevSimError::Configuration(
                "simulation.connect_ms must be greater than zero".into(),
            ));
        }
        if self.simulation.edge_status_ms == 0 {
            return Err(DevSimError::Configuration(
                "simulation.edge_status_ms must be greater than zero".into(),
            ));
        }
        if self.geo.is_empty() {
            return Err(DevSimError::Configuration(
                "at least one [[geo]] area is required".into(),
            ));
        }
        Ok(())
    }

    /// Geo area by index, falling back to the first one.
    pub fn geo_area(&self, index: usize) -> GeoArea {
        self.geo
            .get(index)
            .or_else(|| self.geo.first())
            .cloned()
            .unwrap_or_default()
    }
}

fn default_firmware_ms() -> u64 {
    defaults::FIRMWARE_MS
}

fn default_connect_ms() -> u64 {
    defaults::CONNECT_MS
}

fn default_restart() -> Range<u64> {
    Range::new(defaults::RESTART_MIN_HOURS, defaults::RESTART_MAX_HOURS)
}

fn default_sas_expire_hours() -> u64 {
    defaults::SAS_EXPIRE_HOURS
}

fn default_dps_retries() -> u32 {
    defaults::DPS_RETRIES
}

fn default_true() -> bool {
    true
}

fn default_method_drain_ms() -> u64 {
    defaults::METHOD_DRAIN_MS
}

fn default_transport_stop_ms() -> u64 {
    defaults::TRANSPORT_STOP_MS
}

fn default_edge_status_ms() -> u64 {
    defaults::EDGE_STATUS_MS
}

fn default_secs() -> Range<u64> {
    Range::new(5, 60)
}

fn default_mins() -> Range<u64> {
    Range::new(1, 5)
}

fn default_plan_start_delay_ms() -> i64 {
    defaults::PLAN_START_DELAY_MS
}

fn default_plan_timeline_delay_ms() -> i64 {
    defaults::PLAN_TIMELINE_DELAY_MS
}

fn default_cmd_shutdown() -> String {
    defaults::CMD_SHUTDOWN.to_string()
}

fn default_cmd_reboot() -> String {
    defaults::CMD_REBOOT.to_string()
}

fn default_cmd_firmware() -> String {
    defaults::CMD_FIRMWARE.to_string()
}

fn default_integer_range() -> Range<i64> {
    Range::new(1, 5000)
}

fn default_double_range() -> Range<f64> {
    Range::new(1.0, 5000.0)
}

fn default_vector_range() -> Range<f64> {
    Range::new(1.0, 100.0)
}

fn default_radius() -> f64 {
    1000.0
}

fn default_geo() -> Vec<GeoArea> {
    vec![GeoArea::default()]
}

fn default_global_endpoint() -> String {
    defaults::GLOBAL_DPS_ENDPOINT.to_string()
}
