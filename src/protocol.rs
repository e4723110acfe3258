use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::types::{ParamMap, PresetMode};
use crate::{Error, Result};

pub const CLIMATE_ENDPOINT: &str = "/api_climate";
pub const ACTION_ENDPOINT: &str = "/apiaction";
pub const UPDATE_ENDPOINT: &str = "/intapi";

pub const DEFAULT_PORT: u16 = 80;
pub const DEFAULT_ZONES: &[&str] = &["a1", "a2", "b1", "b2"];

/// Device-wide keys returned by `common=read`, unprefixed.
pub const COMMON_KEYS: &[&str] = &[
    "summermode",
    "avalible_update",
    "fWversion",
    "u_version",
    "out1",
    "out2",
    "out3",
    "out4",
    "out5",
    "out6",
    "out7",
    "out8",
];

/// Zone parameters whose change makes the controller recompute other values
/// (typically `target_temp`) that the action response does not echo.
pub const PRESET_PARAMS: &[&str] = &[
    "away_mode",
    "nightmode",
    "eco_mode",
    "home_mode",
    "comfort_mode",
    "sleep_mode",
];

/// Parameters refreshed into the confirmed cache after a preset follow-up query.
pub const FOLLOW_UP_PARAMS: &[&str] = &[
    "target_temp",
    "power_state",
    "away_mode",
    "nightmode",
    "eco_mode",
    "temperature",
];

pub const API_KEY_PARAM: &str = "apikey_rest";
const STATUS_KEY: &str = "status";

pub fn is_common_key(key: &str) -> bool {
    COMMON_KEYS.contains(&key)
}

/// `zone_a1=1&zone_b2=1[&common=read]`
pub fn zone_query<'a>(zones: impl IntoIterator<Item = &'a str>, include_common: bool) -> String {
    let mut parts: Vec<String> = zones.into_iter().map(|z| format!("zone_{z}=1")).collect();
    if include_common {
        parts.push("common=read".to_string());
    }
    parts.join("&")
}

/// Accepts the shapes the controller has been seen to answer with and folds
/// them into one flat parameter map:
/// - a JSON object,
/// - a list of `[key, value]` pairs,
/// - a list of `{"key": k, "value": v}` / `{"name": k, "value": v}` records,
/// - a list of single-entry objects.
pub fn normalize_response(body: &str) -> Result<ParamMap> {
    let parsed: Value =
        serde_json::from_str(body).map_err(|e| Error::Malformed(format!("not JSON: {e}")))?;

    match parsed {
        Value::Object(map) => Ok(map),
        Value::Array(items) => {
            let mut map = Map::new();
            for item in items {
                let (key, value) = pair_from_item(item)?;
                map.insert(key, value);
            }
            Ok(map)
        }
        other => Err(Error::Malformed(format!(
            "expected object or list of pairs, got {}",
            value_kind(&other)
        ))),
    }
}

fn pair_from_item(item: Value) -> Result<(String, Value)> {
    match item {
        Value::Array(mut pair) if pair.len() == 2 => {
            let value = pair.pop().unwrap_or(Value::Null);
            match pair.pop() {
                Some(Value::String(key)) => Ok((key, value)),
                _ => Err(Error::Malformed("pair key is not a string".to_string())),
            }
        }
        Value::Object(mut obj) => {
            let key = obj
                .get("key")
                .or_else(|| obj.get("name"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            if let Some(key) = key
                && let Some(value) = obj.remove("value")
            {
                return Ok((key, value));
            }
            if obj.len() == 1
                && let Some((key, value)) = obj.into_iter().next()
            {
                return Ok((key, value));
            }
            Err(Error::Malformed("unrecognized list record".to_string()))
        }
        other => Err(Error::Malformed(format!(
            "unexpected list element: {}",
            value_kind(&other)
        ))),
    }
}

fn value_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Parameters of one zone with the `<zone>_` prefix stripped.
pub fn zone_params(raw: &ParamMap, zone: &str) -> ParamMap {
    let prefix = format!("{zone}_");
    raw.iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(&prefix)
                .filter(|param| !param.is_empty())
                .map(|param| (param.to_string(), value.clone()))
        })
        .collect()
}

pub fn common_params(raw: &ParamMap) -> ParamMap {
    raw.iter()
        .filter(|(key, _)| is_common_key(key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Splits `a1_target_temp` into (`a1`, `target_temp`) when `a1` is one of `zones`.
pub fn split_zone_key<'k, I, S>(key: &'k str, zones: I) -> Option<(&'k str, &'k str)>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    zones.into_iter().find_map(|zone| {
        let zone = zone.as_ref();
        let rest = key.strip_prefix(zone)?.strip_prefix('_')?;
        if rest.is_empty() {
            None
        } else {
            Some((&key[..zone.len()], rest))
        }
    })
}

/// The controller has answered with both the Latin and the Cyrillic spelling.
pub fn is_success_status(response: &ParamMap) -> bool {
    matches!(
        response.get(STATUS_KEY).and_then(|v| v.as_str()),
        Some("ok") | Some("\u{043e}\u{043a}")
    )
}

/// Every key of a successful action response except `status`.
pub fn confirmed_values(response: &ParamMap) -> impl Iterator<Item = (&String, &Value)> {
    response.iter().filter(|(key, _)| key.as_str() != STATUS_KEY)
}

pub fn command_pairs(command: &str) -> impl Iterator<Item = (&str, &str)> {
    command
        .split('&')
        .filter_map(|part| part.split_once('='))
        .filter(|(name, _)| !name.is_empty())
}

/// Zones touched by a preset-style parameter in `command`.
pub fn preset_zones<I, S>(command: &str, zones: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S> + Clone,
    S: AsRef<str>,
{
    command_pairs(command)
        .filter_map(|(name, _)| split_zone_key(name, zones.clone()))
        .filter(|(_, param)| PRESET_PARAMS.contains(param))
        .map(|(zone, _)| zone.to_string())
        .collect()
}

/// Two decimals, trailing zeros trimmed: 21.450000000000003 -> "21.45", 21.0 -> "21".
pub fn format_number(value: f64) -> String {
    let s = format!("{value:.2}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" { "0".to_string() } else { s.to_string() }
}

pub fn target_temp_command(zone: &str, celsius: f64) -> String {
    format!("{zone}_target_temp={}", format_number(celsius))
}

pub fn power_command(zone: &str, on: bool) -> String {
    format!("{zone}_power={}", u8::from(on))
}

pub fn preset_command(zone: &str, preset: PresetMode) -> String {
    match preset {
        PresetMode::Away => format!("{zone}_away_mode=1&{zone}_nightmode=0"),
        PresetMode::Eco => format!("{zone}_eco_mode=1"),
        PresetMode::Comfort => {
            format!("{zone}_away_mode=0&{zone}_eco_mode=0&{zone}_nightmode=0")
        }
        PresetMode::Home => format!("{zone}_away_mode=0"),
        PresetMode::Sleep => format!("{zone}_nightmode=1"),
    }
}

pub fn summer_mode_command(on: bool) -> String {
    format!("summermode={}", u8::from(on))
}

pub fn output_command(output: u8, on: bool) -> String {
    format!("out{output}={}", u8::from(on))
}

pub const FLASH_QUERY: &str = "webio_update_flash=1";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> ParamMap {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn zone_query_lists_zones_then_common() {
        let q = zone_query(["a1", "b2"], true);
        assert_eq!(q, "zone_a1=1&zone_b2=1&common=read");
        assert_eq!(zone_query(["a2"], false), "zone_a2=1");
    }

    #[test]
    fn normalize_accepts_object() {
        let m = normalize_response(r#"{"a1_temperature": 20.5, "summermode": 0}"#).unwrap();
        assert_eq!(m["a1_temperature"], json!(20.5));
    }

    #[test]
    fn normalize_accepts_pair_list() {
        let m = normalize_response(r#"[["a1_temperature", 20.5], ["out1", 1]]"#).unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m["out1"], json!(1));
    }

    #[test]
    fn normalize_accepts_record_list() {
        let body = r#"[{"key": "a1_pwm", "value": 40}, {"name": "fWversion", "value": "1.2"}, {"summermode": 1}]"#;
        let m = normalize_response(body).unwrap();
        assert_eq!(m["a1_pwm"], json!(40));
        assert_eq!(m["fWversion"], json!("1.2"));
        assert_eq!(m["summermode"], json!(1));
    }

    #[test]
    fn normalize_rejects_garbage() {
        assert!(matches!(
            normalize_response("<html>busy</html>"),
            Err(Error::Malformed(_))
        ));
        assert!(matches!(normalize_response("42"), Err(Error::Malformed(_))));
        assert!(matches!(
            normalize_response("[1, 2, 3]"),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn zone_params_strip_prefix() {
        let raw = map(json!({
            "a1_target_temp": 21.0,
            "a1_name": "Hall",
            "a2_target_temp": 19.0,
            "summermode": 0
        }));
        let a1 = zone_params(&raw, "a1");
        assert_eq!(a1.len(), 2);
        assert_eq!(a1["target_temp"], json!(21.0));
        assert!(zone_params(&raw, "b1").is_empty());
    }

    #[test]
    fn common_params_only_known_keys() {
        let raw = map(json!({"summermode": 1, "out3": 0, "a1_pwm": 5, "junk": true}));
        let common = common_params(&raw);
        assert_eq!(common.len(), 2);
        assert!(common.contains_key("out3"));
    }

    #[test]
    fn split_zone_key_requires_separator() {
        assert_eq!(
            split_zone_key("a1_target_temp", ["a1", "b1"]),
            Some(("a1", "target_temp"))
        );
        assert_eq!(split_zone_key("a1", ["a1"]), None);
        assert_eq!(split_zone_key("a1_", ["a1"]), None);
        assert_eq!(split_zone_key("summermode", ["a1"]), None);
    }

    #[test]
    fn success_status_both_spellings() {
        assert!(is_success_status(&map(json!({"status": "ok"}))));
        assert!(is_success_status(&map(json!({"status": "\u{043e}\u{043a}"}))));
        assert!(!is_success_status(&map(json!({"status": "error"}))));
        assert!(!is_success_status(&map(json!({"a1_pwm": 3}))));
    }

    #[test]
    fn preset_zones_detected_from_command() {
        let cmd = "a1_away_mode=1&a1_nightmode=0&b2_target_temp=20";
        let zones = preset_zones(cmd, DEFAULT_ZONES.iter().copied());
        assert_eq!(zones.into_iter().collect::<Vec<_>>(), vec!["a1".to_string()]);
        assert!(preset_zones("a1_target_temp=21", ["a1"]).is_empty());
    }

    #[test]
    fn number_formatting() {
        assert_eq!(format_number(21.5), "21.5");
        assert_eq!(format_number(21.0), "21");
        assert_eq!(format_number(21.450000000000003), "21.45");
        assert_eq!(format_number(-0.001), "0");
    }

    #[test]
    fn preset_commands() {
        assert_eq!(
            preset_command("b1", PresetMode::Comfort),
            "b1_away_mode=0&b1_eco_mode=0&b1_nightmode=0"
        );
        assert_eq!(preset_command("a1", PresetMode::Sleep), "a1_nightmode=1");
        assert_eq!(power_command("a2", false), "a2_power=0");
        assert_eq!(output_command(4, true), "out4=1");
    }
}
