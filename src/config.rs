use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{DEFAULT_PORT, DEFAULT_ZONES};
use crate::{Error, Result};

pub const DEFAULT_MIN_TEMP: f64 = 1.0;
pub const DEFAULT_MAX_TEMP: f64 = 100.0;
pub const DEFAULT_TEMP_STEP: f64 = 0.05;
pub const MIN_TEMP_STEP: f64 = 0.01;

/// Per-zone setpoint limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneSettings {
    pub min_temp: f64,
    pub max_temp: f64,
    pub temp_step: f64,
}

impl Default for ZoneSettings {
    fn default() -> Self {
        Self {
            min_temp: DEFAULT_MIN_TEMP,
            max_temp: DEFAULT_MAX_TEMP,
            temp_step: DEFAULT_TEMP_STEP,
        }
    }
}

impl ZoneSettings {
    /// Clamp into `min_temp..=max_temp` and snap to the nearest step.
    pub fn normalize_target(&self, celsius: f64) -> f64 {
        let clamped = celsius.clamp(self.min_temp, self.max_temp);
        let steps = ((clamped - self.min_temp) / self.temp_step).round();
        (self.min_temp + steps * self.temp_step).min(self.max_temp)
    }

    fn validate(&self, zone: &str) -> Result<()> {
        if !(self.min_temp < self.max_temp) {
            return Err(Error::InvalidConfig(format!(
                "zone {zone}: min_temp {} must be below max_temp {}",
                self.min_temp, self.max_temp
            )));
        }
        // Setpoints go over the wire with two decimals.
        if !(self.temp_step >= MIN_TEMP_STEP) {
            return Err(Error::InvalidConfig(format!(
                "zone {zone}: temp_step must be at least {MIN_TEMP_STEP}"
            )));
        }
        Ok(())
    }
}

/// Connection and zone configuration, as persisted by whoever sets the
/// coordinator up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Zones considered active before the first discovery.
    #[serde(default)]
    pub zones: Vec<String>,
    /// Zones probed by every discovery phase.
    #[serde(default = "default_known_zones")]
    pub known_zones: Vec<String>,
    #[serde(default)]
    pub zone_settings: BTreeMap<String, ZoneSettings>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_known_zones() -> Vec<String> {
    DEFAULT_ZONES.iter().map(|z| z.to_string()).collect()
}

impl CoordinatorConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            api_key: None,
            zones: Vec::new(),
            known_zones: default_known_zones(),
            zone_settings: BTreeMap::new(),
        }
    }

    /// Blank keys are treated as no key at all.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.trim().is_empty())
    }

    pub fn zone_settings(&self, zone: &str) -> ZoneSettings {
        self.zone_settings.get(zone).copied().unwrap_or_default()
    }

    /// `known_zones` followed by any configured zone not already in it.
    pub fn discovery_zones(&self) -> Vec<String> {
        let mut zones = self.known_zones.clone();
        for zone in &self.zones {
            if !zones.contains(zone) {
                zones.push(zone.clone());
            }
        }
        zones
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::InvalidConfig("host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::InvalidConfig("port must not be 0".to_string()));
        }
        for zone in self.known_zones.iter().chain(&self.zones) {
            if zone.is_empty() || zone.contains('_') || zone.contains('&') || zone.contains('=') {
                return Err(Error::InvalidConfig(format!("invalid zone id {zone:?}")));
            }
        }
        if self.discovery_zones().is_empty() {
            return Err(Error::InvalidConfig("no zones to discover".to_string()));
        }
        for (zone, settings) in &self.zone_settings {
            settings.validate(zone)?;
        }
        Ok(())
    }
}

/// Poll cadence, timeouts and cache windows.
#[derive(Debug, Clone, PartialEq)]
pub struct Timing {
    pub regular_interval: Duration,
    pub discovery_interval: Duration,
    pub error_retry_delay: Duration,
    /// Consecutive failures before entering degraded mode.
    pub max_errors: u32,
    pub discovery_timeout: Duration,
    pub regular_timeout: Duration,
    pub command_timeout: Duration,
    pub follow_up_timeout: Duration,
    pub flash_timeout: Duration,
    pub confirm_ttl: Duration,
    pub command_debounce: Duration,
    pub preset_follow_up_delay: Duration,
    /// Consecutive discovery misses before an active zone is dropped.
    pub zone_miss_threshold: u32,
    pub firmware_initial_wait: Duration,
    pub firmware_check_interval: Duration,
    pub firmware_max_checks: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            regular_interval: Duration::from_secs(20),
            discovery_interval: Duration::from_secs(5 * 60),
            error_retry_delay: Duration::from_secs(60),
            max_errors: 3,
            discovery_timeout: Duration::from_secs(8),
            regular_timeout: Duration::from_secs(6),
            command_timeout: Duration::from_secs(5),
            follow_up_timeout: Duration::from_secs(6),
            flash_timeout: Duration::from_secs(30),
            confirm_ttl: Duration::from_secs(2),
            command_debounce: Duration::from_millis(1500),
            preset_follow_up_delay: Duration::from_secs(3),
            zone_miss_threshold: 2,
            firmware_initial_wait: Duration::from_secs(30),
            firmware_check_interval: Duration::from_secs(30),
            firmware_max_checks: 10,
        }
    }
}

impl Timing {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.regular_interval.is_zero() || self.error_retry_delay.is_zero() {
            return Err(Error::InvalidConfig(
                "poll intervals must be non-zero".to_string(),
            ));
        }
        if self.max_errors == 0 || self.zone_miss_threshold == 0 {
            return Err(Error::InvalidConfig(
                "max_errors and zone_miss_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_defaults() {
        let cfg: CoordinatorConfig =
            serde_json::from_str(r#"{"host": "192.168.1.50", "zones": ["a1"]}"#).unwrap();
        assert_eq!(cfg.port, 80);
        assert_eq!(cfg.api_key(), None);
        assert_eq!(cfg.known_zones, vec!["a1", "a2", "b1", "b2"]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zone_settings_partial_override() {
        let cfg: CoordinatorConfig = serde_json::from_str(
            r#"{"host": "h", "zone_settings": {"b1": {"max_temp": 30.0}}}"#,
        )
        .unwrap();
        let b1 = cfg.zone_settings("b1");
        assert_eq!(b1.max_temp, 30.0);
        assert_eq!(b1.min_temp, DEFAULT_MIN_TEMP);
        assert_eq!(cfg.zone_settings("a1"), ZoneSettings::default());
    }

    #[test]
    fn blank_api_key_is_none() {
        let mut cfg = CoordinatorConfig::new("h");
        cfg.api_key = Some("  ".to_string());
        assert_eq!(cfg.api_key(), None);
        cfg.api_key = Some("secret".to_string());
        assert_eq!(cfg.api_key(), Some("secret"));
    }

    #[test]
    fn discovery_zones_union_configured() {
        let mut cfg = CoordinatorConfig::new("h");
        cfg.zones = vec!["b2".to_string(), "c1".to_string()];
        assert_eq!(cfg.discovery_zones(), vec!["a1", "a2", "b1", "b2", "c1"]);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = CoordinatorConfig::new("");
        assert!(cfg.validate().is_err());

        cfg.host = "h".to_string();
        cfg.zones = vec!["a_1".to_string()];
        assert!(cfg.validate().is_err());

        cfg.zones.clear();
        cfg.zone_settings.insert(
            "a1".to_string(),
            ZoneSettings {
                min_temp: 30.0,
                max_temp: 10.0,
                temp_step: 0.5,
            },
        );
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn temp_step_finer_than_wire_precision_rejected() {
        let mut cfg = CoordinatorConfig::new("h");
        let mut settings = ZoneSettings {
            temp_step: 0.005,
            ..ZoneSettings::default()
        };
        cfg.zone_settings.insert("a1".to_string(), settings);
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));

        settings.temp_step = MIN_TEMP_STEP;
        cfg.zone_settings.insert("a1".to_string(), settings);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn normalize_target_clamps_and_snaps() {
        let s = ZoneSettings {
            min_temp: 5.0,
            max_temp: 30.0,
            temp_step: 0.5,
        };
        assert_eq!(s.normalize_target(21.3), 21.5);
        assert_eq!(s.normalize_target(2.0), 5.0);
        assert_eq!(s.normalize_target(45.0), 30.0);
    }

    #[test]
    fn zero_thresholds_rejected() {
        let timing = Timing {
            max_errors: 0,
            ..Timing::default()
        };
        assert!(timing.validate().is_err());
        assert!(Timing::default().validate().is_ok());
    }
}
