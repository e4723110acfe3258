use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::trace;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    confirmed_at: Instant,
}

/// Values echoed by successful commands, keyed by full wire key
/// (`a1_target_temp`, `summermode`). An entry beats polled data for the same
/// key while it is younger than the TTL. Expired entries are dropped lazily.
#[derive(Debug)]
pub(crate) struct ConfirmedCache {
    ttl: Duration,
    entries: HashMap<String, CacheEntry>,
}

impl ConfirmedCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    fn is_fresh(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.confirmed_at) < self.ttl
    }

    pub fn put(&mut self, key: impl Into<String>, value: Value, confirmed_at: Instant) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                confirmed_at,
            },
        );
    }

    /// The confirmed value when one is still fresh, otherwise `polled`.
    pub fn resolve(&mut self, key: &str, polled: Value, now: Instant) -> Value {
        match self.entries.get(key) {
            Some(entry) if self.is_fresh(entry, now) => {
                trace!(key, "using confirmed value over polled");
                entry.value.clone()
            }
            Some(_) => {
                self.entries.remove(key);
                polled
            }
            None => polled,
        }
    }

    /// Drops every expired entry and returns how many went.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.confirmed_at) < ttl);
        before - self.entries.len()
    }

    pub fn fresh_entries(&self, now: Instant) -> impl Iterator<Item = (&str, &Value)> {
        self.entries
            .iter()
            .filter(move |(_, e)| self.is_fresh(e, now))
            .map(|(k, e)| (k.as_str(), &e.value))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// What to do with a command string that may have been sent moments ago.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Debounce {
    Send,
    /// Identical command inside the window; report this instead of sending.
    /// `true` while the original is in flight. Once it has finished this is
    /// the original's outcome, so a duplicate of a rejected command reports
    /// `false` rather than blanket success.
    Suppressed(bool),
}

#[derive(Debug, Clone, Copy)]
struct CommandRecord {
    sent_at: Instant,
    outcome: Option<bool>,
}

#[derive(Debug)]
pub(crate) struct CommandDebouncer {
    window: Duration,
    records: HashMap<String, CommandRecord>,
}

impl CommandDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            records: HashMap::new(),
        }
    }

    /// Records `command` as sent at `now` unless an identical one is still
    /// inside the window. An in-flight duplicate reports success; a finished
    /// one reports whatever the original got.
    pub fn check(&mut self, command: &str, now: Instant) -> Debounce {
        let window = self.window;
        self.records
            .retain(|_, r| now.saturating_duration_since(r.sent_at) < window);

        if let Some(record) = self.records.get(command) {
            return Debounce::Suppressed(record.outcome.unwrap_or(true));
        }
        self.records.insert(
            command.to_string(),
            CommandRecord {
                sent_at: now,
                outcome: None,
            },
        );
        Debounce::Send
    }

    pub fn finish(&mut self, command: &str, sent_at: Instant, ok: bool) {
        if let Some(record) = self.records.get_mut(command)
            && record.sent_at == sent_at
        {
            record.outcome = Some(ok);
        }
    }
}
