use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::warn;

use crate::diff::diff_params;
use crate::types::ParamMap;

/// How poll bodies are written to the wire-trace log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLogMode {
    /// Every poll body in full.
    Full,
    /// First body in full, then only changed or removed keys.
    Diffed,
}

/// Newline-delimited JSON trace of what went over the wire.
pub(crate) struct MessageLogger {
    mode: MessageLogMode,
    file: File,
    /// Last body per poll phase; phases query different zone sets.
    previous_poll: HashMap<String, ParamMap>,
}

impl MessageLogger {
    pub fn new(mode: MessageLogMode, path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            mode,
            file,
            previous_poll: HashMap::new(),
        })
    }

    /// `query` must already have the API key stripped.
    pub fn log_request(&mut self, endpoint: &str, query: &str) {
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "req",
            "endpoint": endpoint,
            "query": query,
        });
        self.write_line(&entry);
    }

    pub fn log_poll(&mut self, phase: &str, status: u16, body: Option<&ParamMap>) {
        let Some(body) = body else {
            let entry = json!({
                "ts": Utc::now().to_rfc3339(),
                "dir": "poll",
                "phase": phase,
                "status": status,
            });
            self.write_line(&entry);
            return;
        };

        let entry = match (self.mode, self.previous_poll.get(phase)) {
            (MessageLogMode::Diffed, Some(prev)) => {
                let changes: Vec<Value> = diff_params(prev, body)
                    .into_iter()
                    .map(|c| json!({ "key": c.key, "old": c.old, "new": c.new }))
                    .collect();
                json!({
                    "ts": Utc::now().to_rfc3339(),
                    "dir": "poll",
                    "phase": phase,
                    "status": status,
                    "changes": changes,
                })
            }
            (MessageLogMode::Diffed, None) => json!({
                "ts": Utc::now().to_rfc3339(),
                "dir": "poll",
                "phase": phase,
                "status": status,
                "full": true,
                "body": body,
            }),
            (MessageLogMode::Full, _) => json!({
                "ts": Utc::now().to_rfc3339(),
                "dir": "poll",
                "phase": phase,
                "status": status,
                "body": body,
            }),
        };
        self.write_line(&entry);
        if self.mode == MessageLogMode::Diffed {
            self.previous_poll.insert(phase.to_string(), body.clone());
        }
    }

    pub fn log_command(&mut self, command: &str, status: u16, response: Option<&ParamMap>) {
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "cmd",
            "command": command,
            "status": status,
            "response": response,
        });
        self.write_line(&entry);
    }

    fn write_line(&mut self, entry: &Value) {
        if let Ok(line) = serde_json::to_string(entry)
            && let Err(e) = writeln!(self.file, "{line}")
        {
            warn!("failed to write log entry: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::NamedTempFile;

    fn read_lines(path: &Path) -> Vec<Value> {
        let mut contents = String::new();
        File::open(path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn body(v: Value) -> ParamMap {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn log_request_writes_ndjson() {
        let tmp = NamedTempFile::new().unwrap();
        let mut logger = MessageLogger::new(MessageLogMode::Full, tmp.path()).unwrap();
        logger.log_request("/api_climate", "zone_a1=1&common=read");

        let lines = read_lines(tmp.path());
        assert_eq!(lines[0]["dir"], "req");
        assert_eq!(lines[0]["endpoint"], "/api_climate");
        assert!(lines[0]["ts"].as_str().is_some());
    }

    #[test]
    fn diffed_mode_logs_full_first_then_changes() {
        let tmp = NamedTempFile::new().unwrap();
        let mut logger = MessageLogger::new(MessageLogMode::Diffed, tmp.path()).unwrap();
        logger.log_poll("regular", 200, Some(&body(json!({"a1_temperature": 20.0}))));
        logger.log_poll("regular", 200, Some(&body(json!({"a1_temperature": 20.5}))));

        let lines = read_lines(tmp.path());
        assert_eq!(lines[0]["full"], true);
        assert!(lines[0]["body"].is_object());
        let changes = lines[1]["changes"].as_array().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0]["key"], "a1_temperature");
        assert_eq!(changes[0]["new"], 20.5);
    }

    #[test]
    fn diffed_mode_no_changes_logs_empty_array() {
        let tmp = NamedTempFile::new().unwrap();
        let mut logger = MessageLogger::new(MessageLogMode::Diffed, tmp.path()).unwrap();
        let b = body(json!({"summermode": 0}));
        logger.log_poll("regular", 200, Some(&b));
        logger.log_poll("regular", 200, Some(&b));

        let lines = read_lines(tmp.path());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["changes"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn diffed_mode_compares_within_the_same_phase() {
        let tmp = NamedTempFile::new().unwrap();
        let mut logger = MessageLogger::new(MessageLogMode::Diffed, tmp.path()).unwrap();
        logger.log_poll(
            "discovery",
            200,
            Some(&body(json!({"a1_temperature": 20.0, "b2_temperature": 18.0}))),
        );
        logger.log_poll("regular", 200, Some(&body(json!({"a1_temperature": 20.0}))));
        logger.log_poll("regular", 200, Some(&body(json!({"a1_temperature": 20.0}))));
        logger.log_poll(
            "discovery",
            200,
            Some(&body(json!({"a1_temperature": 20.0, "b2_temperature": 18.0}))),
        );

        let lines = read_lines(tmp.path());
        assert_eq!(lines[1]["full"], true, "first regular body is logged in full");
        assert_eq!(lines[2]["changes"].as_array().unwrap().len(), 0);
        assert_eq!(lines[3]["changes"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn failed_poll_logs_status_only() {
        let tmp = NamedTempFile::new().unwrap();
        let mut logger = MessageLogger::new(MessageLogMode::Full, tmp.path()).unwrap();
        logger.log_poll("regular", 401, None);

        let lines = read_lines(tmp.path());
        assert_eq!(lines[0]["status"], 401);
        assert!(lines[0].get("body").is_none());
    }

    #[test]
    fn log_command_captures_response() {
        let tmp = NamedTempFile::new().unwrap();
        let mut logger = MessageLogger::new(MessageLogMode::Full, tmp.path()).unwrap();
        let resp = body(json!({"status": "ok", "a1_target_temp": 21.5}));
        logger.log_command("a1_target_temp=21.5", 200, Some(&resp));

        let lines = read_lines(tmp.path());
        assert_eq!(lines[0]["dir"], "cmd");
        assert_eq!(lines[0]["command"], "a1_target_temp=21.5");
        assert_eq!(lines[0]["response"]["a1_target_temp"], 21.5);
    }
}
