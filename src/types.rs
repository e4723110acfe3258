use std::fmt;

use serde_json::{Map, Value};

/// Flat parameter name -> value mapping, as the controller reports it.
pub type ParamMap = Map<String, Value>;

/// Numbers, numeric strings and booleans all show up on the wire.
pub(crate) fn value_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// 0/1 flags; any non-zero number counts as set.
pub(crate) fn value_flag(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        other => value_f64(other).map(|n| n != 0.0),
    }
}

pub(crate) fn value_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvacMode {
    Off,
    Heat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvacAction {
    Off,
    Idle,
    Heating,
}

/// Presets the zone thermostat exposes. When reading a zone back, flags are
/// resolved with the precedence night > away > eco > comfort, so `Home` is
/// only ever produced by a command, never derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresetMode {
    Comfort,
    Away,
    Eco,
    Home,
    Sleep,
}

impl PresetMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresetMode::Comfort => "comfort",
            PresetMode::Away => "away",
            PresetMode::Eco => "eco",
            PresetMode::Home => "home",
            PresetMode::Sleep => "sleep",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "comfort" => Some(PresetMode::Comfort),
            "away" => Some(PresetMode::Away),
            "eco" => Some(PresetMode::Eco),
            "home" => Some(PresetMode::Home),
            "sleep" => Some(PresetMode::Sleep),
            _ => None,
        }
    }

    pub fn from_flags(night: bool, away: bool, eco: bool) -> Self {
        if night {
            PresetMode::Sleep
        } else if away {
            PresetMode::Away
        } else if eco {
            PresetMode::Eco
        } else {
            PresetMode::Comfort
        }
    }
}

impl fmt::Display for PresetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValveState {
    /// 0..=100
    pub position: Option<u8>,
    pub opening: Option<bool>,
    pub closing: Option<bool>,
    pub closed: Option<bool>,
}

const VALVE_KEYS: &[&str] = &["valve_pos", "valve_opening", "valve_closing", "valve_closed"];

/// Read-only view over one zone's merged parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneView {
    pub id: String,
    pub params: ParamMap,
}

impl ZoneView {
    pub fn new(id: impl Into<String>, params: ParamMap) -> Self {
        Self {
            id: id.into(),
            params,
        }
    }

    pub fn get(&self, param: &str) -> Option<&Value> {
        self.params.get(param)
    }

    fn number(&self, param: &str) -> Option<f64> {
        self.params.get(param).and_then(value_f64)
    }

    fn flag(&self, param: &str) -> bool {
        self.params.get(param).and_then(value_flag).unwrap_or(false)
    }

    pub fn name(&self) -> String {
        self.params
            .get("name")
            .and_then(value_text)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("Zone {}", self.id.to_uppercase()))
    }

    pub fn power_on(&self) -> bool {
        self.flag("power_state")
    }

    pub fn burner_on(&self) -> bool {
        self.flag("burner")
    }

    pub fn night_mode(&self) -> bool {
        self.flag("nightmode")
    }

    pub fn away_mode(&self) -> bool {
        self.flag("away_mode")
    }

    pub fn eco_mode(&self) -> bool {
        self.flag("eco_mode")
    }

    pub fn target_temperature(&self) -> Option<f64> {
        self.number("target_temp")
    }

    pub fn current_temperature(&self) -> Option<f64> {
        self.number("temperature")
    }

    /// Burner PWM modulation level.
    pub fn modulation(&self) -> Option<f64> {
        self.number("pwm")
    }

    pub fn hvac_mode(&self) -> HvacMode {
        if self.power_on() {
            HvacMode::Heat
        } else {
            HvacMode::Off
        }
    }

    pub fn hvac_action(&self) -> HvacAction {
        match (self.power_on(), self.burner_on()) {
            (false, _) => HvacAction::Off,
            (true, true) => HvacAction::Heating,
            (true, false) => HvacAction::Idle,
        }
    }

    pub fn preset(&self) -> PresetMode {
        PresetMode::from_flags(self.night_mode(), self.away_mode(), self.eco_mode())
    }

    pub fn has_valve(&self) -> bool {
        VALVE_KEYS.iter().any(|k| self.params.contains_key(*k))
    }

    pub fn valve(&self) -> Option<ValveState> {
        if !self.has_valve() {
            return None;
        }
        let position = self
            .number("valve_pos")
            .map(|p| p.trunc().clamp(0.0, 100.0) as u8);
        let flag = |key: &str| self.params.get(key).and_then(value_flag);
        let closed = flag("valve_closed").or(position.map(|p| p == 0));
        Some(ValveState {
            position,
            opening: flag("valve_opening"),
            closing: flag("valve_closing"),
            closed,
        })
    }
}

/// Read-only view over the device-wide parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommonView {
    pub params: ParamMap,
}

impl CommonView {
    pub fn new(params: ParamMap) -> Self {
        Self { params }
    }

    pub fn summer_mode(&self) -> bool {
        self.params
            .get("summermode")
            .and_then(value_flag)
            .unwrap_or(false)
    }

    /// Relay output `n` (1..=8). `None` when the controller does not report it.
    pub fn output(&self, n: u8) -> Option<bool> {
        if !(1..=8).contains(&n) {
            return None;
        }
        self.params.get(&format!("out{n}")).and_then(value_flag)
    }

    pub fn firmware_version(&self) -> Option<String> {
        self.params.get("fWversion").and_then(value_text)
    }

    pub fn candidate_version(&self) -> Option<String> {
        self.params.get("u_version").and_then(value_text)
    }

    /// The raw `avalible_update` flag.
    pub fn update_flag(&self) -> bool {
        self.params
            .get("avalible_update")
            .and_then(value_f64)
            .is_some_and(|v| v == 1.0)
    }

    pub fn update_available(&self) -> bool {
        if !self.update_flag() {
            return false;
        }
        let (Some(installed), Some(candidate)) =
            (self.firmware_version(), self.candidate_version())
        else {
            return true;
        };
        match (installed.parse::<f64>(), candidate.parse::<f64>()) {
            (Ok(i), Ok(c)) => c > i,
            _ => installed != candidate,
        }
    }

    pub fn latest_version(&self) -> Option<String> {
        if self.update_flag()
            && let Some(candidate) = self.candidate_version()
        {
            return Some(candidate);
        }
        self.firmware_version()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn zone(v: Value) -> ZoneView {
        ZoneView::new("a1", v.as_object().cloned().unwrap())
    }

    fn common(v: Value) -> CommonView {
        CommonView::new(v.as_object().cloned().unwrap())
    }

    #[test]
    fn zone_name_falls_back_to_id() {
        assert_eq!(zone(json!({})).name(), "Zone A1");
        assert_eq!(zone(json!({"name": " Kitchen "})).name(), "Kitchen");
    }

    #[test]
    fn lenient_numeric_parsing() {
        let z = zone(json!({"target_temp": "21.5", "temperature": 19, "pwm": "n/a"}));
        assert_eq!(z.target_temperature(), Some(21.5));
        assert_eq!(z.current_temperature(), Some(19.0));
        assert_eq!(z.modulation(), None);
    }

    #[test]
    fn hvac_action_follows_power_and_burner() {
        assert_eq!(zone(json!({"power_state": 0, "burner": 1})).hvac_action(), HvacAction::Off);
        assert_eq!(zone(json!({"power_state": 1, "burner": 1})).hvac_action(), HvacAction::Heating);
        assert_eq!(zone(json!({"power_state": 1, "burner": 0})).hvac_action(), HvacAction::Idle);
        assert_eq!(zone(json!({"power_state": "1"})).hvac_mode(), HvacMode::Heat);
    }

    #[test]
    fn preset_precedence_night_away_eco_comfort() {
        let all = zone(json!({"nightmode": 1, "away_mode": 1, "eco_mode": 1}));
        assert_eq!(all.preset(), PresetMode::Sleep);
        let away_eco = zone(json!({"nightmode": 0, "away_mode": 1, "eco_mode": 1}));
        assert_eq!(away_eco.preset(), PresetMode::Away);
        assert_eq!(zone(json!({"eco_mode": 1})).preset(), PresetMode::Eco);
        assert_eq!(zone(json!({})).preset(), PresetMode::Comfort);
    }

    #[test]
    fn preset_names() {
        for p in [
            PresetMode::Comfort,
            PresetMode::Away,
            PresetMode::Eco,
            PresetMode::Home,
            PresetMode::Sleep,
        ] {
            assert_eq!(PresetMode::from_name(p.as_str()), Some(p));
        }
        assert_eq!(PresetMode::from_name("boost"), None);
    }

    #[test]
    fn valve_absent_without_keys() {
        assert!(zone(json!({"pwm": 30})).valve().is_none());
    }

    #[test]
    fn valve_position_clamped_and_closed_derived() {
        let v = zone(json!({"valve_pos": 140.7})).valve().unwrap();
        assert_eq!(v.position, Some(100));
        assert_eq!(v.closed, Some(false));

        let v = zone(json!({"valve_pos": "0", "valve_opening": 1})).valve().unwrap();
        assert_eq!(v.closed, Some(true));
        assert_eq!(v.opening, Some(true));
        assert_eq!(v.closing, None);

        let v = zone(json!({"valve_pos": 0, "valve_closed": 0})).valve().unwrap();
        assert_eq!(v.closed, Some(false));
    }

    #[test]
    fn outputs_and_summer_mode() {
        let c = common(json!({"summermode": 1, "out1": 1, "out2": 0}));
        assert!(c.summer_mode());
        assert_eq!(c.output(1), Some(true));
        assert_eq!(c.output(2), Some(false));
        assert_eq!(c.output(3), None);
        assert_eq!(c.output(9), None);
    }

    #[test]
    fn update_available_compares_versions() {
        let newer = common(json!({"avalible_update": 1, "fWversion": "1.10", "u_version": "1.12"}));
        assert!(newer.update_available());
        assert_eq!(newer.latest_version().as_deref(), Some("1.12"));

        let same = common(json!({"avalible_update": 1, "fWversion": 2.0, "u_version": 2.0}));
        assert!(!same.update_available());

        let textual = common(json!({"avalible_update": 1, "fWversion": "v1-a", "u_version": "v1-b"}));
        assert!(textual.update_available());

        let unflagged = common(json!({"avalible_update": 0, "fWversion": "1.0", "u_version": "2.0"}));
        assert!(!unflagged.update_available());
        assert_eq!(unflagged.latest_version().as_deref(), Some("1.0"));
    }
}
