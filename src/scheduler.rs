use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::Timing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    Normal,
    /// Too many consecutive failures: slow retry cadence, discovery every tick.
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Every statically-known zone; may change the active set.
    Discovery,
    /// Only the active zones.
    Regular,
}

/// Snapshot of the scheduler for callers that want to show it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub mode: PollMode,
    pub consecutive_failures: u32,
    pub interval: Duration,
}

#[derive(Debug)]
pub(crate) struct PollScheduler {
    regular_interval: Duration,
    error_retry_delay: Duration,
    discovery_interval: Duration,
    max_errors: u32,
    zone_miss_threshold: u32,
    mode: PollMode,
    error_count: u32,
    last_discovery: Option<Instant>,
    discovery_forced: bool,
    misses: HashMap<String, u32>,
}

impl PollScheduler {
    pub fn new(timing: &Timing) -> Self {
        Self {
            regular_interval: timing.regular_interval,
            error_retry_delay: timing.error_retry_delay,
            discovery_interval: timing.discovery_interval,
            max_errors: timing.max_errors,
            zone_miss_threshold: timing.zone_miss_threshold,
            mode: PollMode::Normal,
            error_count: 0,
            last_discovery: None,
            discovery_forced: false,
            misses: HashMap::new(),
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            mode: self.mode,
            consecutive_failures: self.error_count,
            interval: self.interval(),
        }
    }

    pub fn interval(&self) -> Duration {
        match self.mode {
            PollMode::Normal => self.regular_interval,
            PollMode::Degraded => self.error_retry_delay,
        }
    }

    pub fn select_phase(&self, now: Instant, active_empty: bool) -> Phase {
        if self.discovery_forced || self.mode == PollMode::Degraded {
            return Phase::Discovery;
        }
        let due = self
            .last_discovery
            .is_none_or(|at| now.saturating_duration_since(at) >= self.discovery_interval);
        if due {
            return Phase::Discovery;
        }
        if active_empty {
            warn!("no active zones, falling back to discovery");
            return Phase::Discovery;
        }
        Phase::Regular
    }

    pub fn force_discovery(&mut self) {
        self.discovery_forced = true;
    }

    /// Returns true when this success ended degraded mode.
    pub fn record_success(&mut self, phase: Phase, now: Instant) -> bool {
        if phase == Phase::Discovery {
            self.last_discovery = Some(now);
            self.discovery_forced = false;
        }
        self.error_count = 0;
        let recovered = self.mode == PollMode::Degraded;
        if recovered {
            info!(interval = ?self.regular_interval, "poll recovered, leaving degraded mode");
        }
        self.mode = PollMode::Normal;
        recovered
    }

    /// Returns true when this failure pushed the scheduler into degraded mode.
    pub fn record_failure(&mut self) -> bool {
        self.error_count = self.error_count.saturating_add(1);
        if self.mode == PollMode::Normal && self.error_count >= self.max_errors {
            warn!(
                failures = self.error_count,
                retry_in = ?self.error_retry_delay,
                "repeated poll failures, entering degraded mode"
            );
            self.mode = PollMode::Degraded;
            self.discovery_forced = true;
            return true;
        }
        debug!(failures = self.error_count, "poll failed");
        false
    }

    /// Computes the next active set from a discovery result. Newly reporting
    /// zones join at once; an active zone is only dropped after it has been
    /// missing from `zone_miss_threshold` consecutive discoveries.
    pub fn reconcile_zones(
        &mut self,
        active: &BTreeSet<String>,
        reporting: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        let mut next = reporting.clone();
        for zone in reporting {
            self.misses.remove(zone);
        }
        for zone in active.difference(reporting) {
            let misses = self.misses.entry(zone.clone()).or_insert(0);
            *misses += 1;
            if *misses < self.zone_miss_threshold {
                debug!(zone = %zone, misses = *misses, "active zone missing from discovery");
                next.insert(zone.clone());
            } else {
                self.misses.remove(zone);
            }
        }
        self.misses.retain(|zone, _| next.contains(zone));
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(zones: &[&str]) -> BTreeSet<String> {
        zones.iter().map(|z| z.to_string()).collect()
    }

    fn scheduler() -> PollScheduler {
        PollScheduler::new(&Timing::default())
    }

    #[test]
    fn first_tick_is_discovery() {
        let s = scheduler();
        assert_eq!(s.select_phase(Instant::now(), false), Phase::Discovery);
        assert_eq!(s.interval(), Duration::from_secs(20));
    }

    #[test]
    fn regular_until_discovery_interval_elapses() {
        let mut s = scheduler();
        let t0 = Instant::now();
        s.record_success(Phase::Discovery, t0);
        assert_eq!(s.select_phase(t0 + Duration::from_secs(20), false), Phase::Regular);
        assert_eq!(s.select_phase(t0 + Duration::from_secs(299), false), Phase::Regular);
        assert_eq!(s.select_phase(t0 + Duration::from_secs(300), false), Phase::Discovery);
    }

    #[test]
    fn empty_active_set_falls_back_to_discovery() {
        let mut s = scheduler();
        let t0 = Instant::now();
        s.record_success(Phase::Discovery, t0);
        assert_eq!(s.select_phase(t0 + Duration::from_secs(1), true), Phase::Discovery);
    }

    #[test]
    fn degraded_after_max_errors_and_recovers() {
        let mut s = scheduler();
        let t0 = Instant::now();
        s.record_success(Phase::Discovery, t0);

        assert!(!s.record_failure());
        assert!(!s.record_failure());
        assert_eq!(s.status().mode, PollMode::Normal);
        assert!(s.record_failure());
        assert_eq!(s.status().mode, PollMode::Degraded);
        assert_eq!(s.interval(), Duration::from_secs(60));
        assert_eq!(s.select_phase(t0 + Duration::from_secs(1), false), Phase::Discovery);

        assert!(!s.record_failure(), "already degraded");
        assert_eq!(s.status().consecutive_failures, 4);

        assert!(s.record_success(Phase::Discovery, t0 + Duration::from_secs(2)));
        let status = s.status();
        assert_eq!(status.mode, PollMode::Normal);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.interval, Duration::from_secs(20));
        assert_eq!(s.select_phase(t0 + Duration::from_secs(3), false), Phase::Regular);
    }

    #[test]
    fn regular_success_also_recovers_but_keeps_forced_discovery() {
        let mut s = scheduler();
        let t0 = Instant::now();
        s.record_success(Phase::Discovery, t0);
        for _ in 0..3 {
            s.record_failure();
        }
        assert!(s.record_success(Phase::Regular, t0));
        assert_eq!(s.interval(), Duration::from_secs(20));
        assert_eq!(s.select_phase(t0, false), Phase::Discovery);
    }

    #[test]
    fn zones_join_immediately_and_leave_after_two_misses() {
        let mut s = scheduler();
        let active = set(&["a1", "b2"]);

        let next = s.reconcile_zones(&active, &set(&["a1", "a2"]));
        assert_eq!(next, set(&["a1", "a2", "b2"]), "b2 survives its first miss");

        let next = s.reconcile_zones(&next, &set(&["a1", "a2"]));
        assert_eq!(next, set(&["a1", "a2"]), "b2 dropped on the second miss");
    }

    #[test]
    fn miss_counter_resets_when_zone_reports_again() {
        let mut s = scheduler();
        let active = set(&["a1", "b2"]);
        let next = s.reconcile_zones(&active, &set(&["a1"]));
        let next = s.reconcile_zones(&next, &set(&["a1", "b2"]));
        let next = s.reconcile_zones(&next, &set(&["a1"]));
        assert!(next.contains("b2"));
    }

    #[test]
    fn threshold_one_drops_immediately() {
        let timing = Timing {
            zone_miss_threshold: 1,
            ..Timing::default()
        };
        let mut s = PollScheduler::new(&timing);
        let next = s.reconcile_zones(&set(&["a1", "b2"]), &set(&["a1"]));
        assert_eq!(next, set(&["a1"]));
    }
}
