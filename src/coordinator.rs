use std::collections::BTreeSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::{Notify, broadcast, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::cache::{CommandDebouncer, ConfirmedCache, Debounce};
use crate::client::DeviceClient;
use crate::config::{CoordinatorConfig, Timing, ZoneSettings};
use crate::diff::diff_params;
use crate::logger::MessageLogMode;
use crate::protocol::{
    FOLLOW_UP_PARAMS, command_pairs, confirmed_values, output_command, power_command,
    preset_command, preset_zones, summer_mode_command, target_temp_command, zone_params,
};
use crate::scheduler::{Phase, PollScheduler, SchedulerStatus};
use crate::store::ZoneStore;
use crate::types::{CommonView, HvacMode, ParamMap, PresetMode, ZoneView};
use crate::{Error, Result};

type Listener = Arc<dyn Fn() + Send + Sync>;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Typed notifications, delivered through [`Coordinator::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// State changed (poll, failed poll, or command); re-read the accessors.
    Updated,
    /// Discovery changed the active zone set. Carries the new set.
    ZonesChanged(BTreeSet<String>),
    /// A poll failed with a recoverable error.
    UpdateFailed(String),
    /// The controller answered 401. Polling stays paused until
    /// [`Coordinator::reauthenticate`] is called.
    AuthFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Sent and confirmed; the echoed values are in the cache.
    Applied,
    /// Identical command inside the debounce window; not re-sent. Carries the
    /// result reported for it.
    Debounced(bool),
}

struct State {
    store: ZoneStore,
    cache: ConfirmedCache,
    debouncer: CommandDebouncer,
    scheduler: PollScheduler,
    active_zones: BTreeSet<String>,
    last_update_success: bool,
    auth_failed: bool,
}

pub(crate) struct Inner {
    pub(crate) client: DeviceClient,
    config: CoordinatorConfig,
    discovery_zones: Vec<String>,
    pub(crate) timing: Timing,
    state: Mutex<State>,
    /// Serializes scheduled ticks with forced refreshes.
    poll_lock: tokio::sync::Mutex<()>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    events: broadcast::Sender<CoordinatorEvent>,
    reauth: Notify,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<AbortHandle>>,
    pub(crate) firmware: Mutex<Option<AbortHandle>>,
}

pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    timing: Timing,
    listeners: Vec<Listener>,
    log_mode: Option<MessageLogMode>,
    log_path: Option<String>,
}

impl CoordinatorBuilder {
    pub fn new(host: impl Into<String>) -> Self {
        Self::from_config(CoordinatorConfig::new(host))
    }

    pub fn from_config(config: CoordinatorConfig) -> Self {
        Self {
            config,
            timing: Timing::default(),
            listeners: Vec::new(),
            log_mode: None,
            log_path: None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    /// Zones treated as active until the first discovery says otherwise.
    pub fn zones<I, S>(mut self, zones: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.zones = zones.into_iter().map(Into::into).collect();
        self
    }

    pub fn known_zones<I, S>(mut self, zones: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.known_zones = zones.into_iter().map(Into::into).collect();
        self
    }

    pub fn zone_settings(mut self, zone: impl Into<String>, settings: ZoneSettings) -> Self {
        self.config.zone_settings.insert(zone.into(), settings);
        self
    }

    pub fn timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn on_update(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.listeners.push(Arc::new(f));
        self
    }

    pub fn message_log(mut self, mode: MessageLogMode, path: impl Into<String>) -> Self {
        self.log_mode = Some(mode);
        self.log_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<Coordinator> {
        self.config.validate()?;
        self.timing.validate()?;

        let message_log = self.log_mode.zip(self.log_path);
        let client = DeviceClient::new(
            &self.config.host,
            self.config.port,
            self.config.api_key().map(str::to_string),
            message_log,
        )?;

        let state = State {
            store: ZoneStore::default(),
            cache: ConfirmedCache::new(self.timing.confirm_ttl),
            debouncer: CommandDebouncer::new(self.timing.command_debounce),
            scheduler: PollScheduler::new(&self.timing),
            active_zones: self.config.zones.iter().cloned().collect(),
            last_update_success: false,
            auth_failed: false,
        };

        let listeners = self
            .listeners
            .into_iter()
            .enumerate()
            .map(|(i, l)| (ListenerId(i as u64), l))
            .collect::<Vec<_>>();
        let next_listener = AtomicU64::new(listeners.len() as u64);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        debug!(host = %self.config.host, port = self.config.port, "coordinator configured");

        Ok(Coordinator {
            inner: Arc::new(Inner {
                client,
                discovery_zones: self.config.discovery_zones(),
                config: self.config,
                timing: self.timing,
                state: Mutex::new(state),
                poll_lock: tokio::sync::Mutex::new(()),
                listeners: Mutex::new(listeners),
                next_listener,
                events,
                reauth: Notify::new(),
                shutdown,
                tasks: Mutex::new(Vec::new()),
                firmware: Mutex::new(None),
            }),
        })
    }
}

/// Handle to the spawned poll loop.
pub struct PollLoop {
    handle: JoinHandle<()>,
}

impl PollLoop {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the loop to exit after [`Coordinator::shutdown`].
    pub async fn join(self) {
        if let Err(e) = self.handle.await
            && e.is_panic()
        {
            error!("poll loop panicked");
        }
    }
}

/// Shared handle to one controller's state. Cheap to clone.
#[derive(Clone)]
pub struct Coordinator {
    pub(crate) inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Coordinator {
    pub fn builder(host: impl Into<String>) -> CoordinatorBuilder {
        CoordinatorBuilder::new(host)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.inner.state)
    }

    // -- Read accessors --

    /// Merged parameters of `zone`, prefix stripped. Empty when unknown.
    pub fn zone_data(&self, zone: &str) -> ParamMap {
        self.state().store.zone(zone).cloned().unwrap_or_default()
    }

    pub fn zone(&self, zone: &str) -> Option<ZoneView> {
        self.state()
            .store
            .zone(zone)
            .map(|params| ZoneView::new(zone, params.clone()))
    }

    /// Every zone present in the last poll, merged with confirmed values.
    pub fn zones(&self) -> Vec<ZoneView> {
        self.state()
            .store
            .zones()
            .iter()
            .map(|(id, params)| ZoneView::new(id.clone(), params.clone()))
            .collect()
    }

    pub fn common_data(&self) -> ParamMap {
        self.state().store.common().clone()
    }

    pub fn common(&self) -> CommonView {
        CommonView::new(self.common_data())
    }

    pub fn active_zones(&self) -> BTreeSet<String> {
        self.state().active_zones.clone()
    }

    /// Zones that had data in the last successful poll.
    pub fn reporting_zones(&self) -> BTreeSet<String> {
        self.state().store.reporting().cloned().collect()
    }

    /// True only while the most recent poll succeeded.
    pub fn available(&self) -> bool {
        self.state().last_update_success
    }

    /// Requires the zone to have reported in the last poll. A zone kept
    /// active through a missed discovery still has data but is unavailable.
    pub fn zone_available(&self, zone: &str) -> bool {
        let st = self.state();
        st.last_update_success && st.store.is_reporting(zone)
    }

    /// Set after a 401 on a poll; cleared by [`Coordinator::reauthenticate`].
    pub fn auth_failed(&self) -> bool {
        self.state().auth_failed
    }

    pub fn scheduler_status(&self) -> SchedulerStatus {
        self.state().scheduler.status()
    }

    pub fn zone_settings(&self, zone: &str) -> ZoneSettings {
        self.inner.config.zone_settings(zone)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    // -- Notification --

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.inner.events.subscribe()
    }

    pub fn add_listener(&self, f: impl Fn() + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.listeners).push((id, Arc::new(f)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn emit(&self, event: CoordinatorEvent) {
        // No receivers is fine.
        let _ = self.inner.events.send(event);
    }

    /// Runs every listener; a panicking listener is logged and skipped.
    /// Must be called without the state lock held.
    fn notify_listeners(&self) {
        let listeners: Vec<Listener> = lock(&self.inner.listeners)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
                error!("update listener panicked");
            }
        }
        self.emit(CoordinatorEvent::Updated);
    }

    // -- Polling --

    /// Starts the poll loop on the current Tokio runtime. The first tick runs
    /// immediately.
    pub fn spawn(&self) -> PollLoop {
        let coordinator = self.clone();
        let stop = self.inner.shutdown.subscribe();
        PollLoop {
            handle: tokio::spawn(async move { coordinator.run(stop).await }),
        }
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                break;
            }
            if self.auth_failed() {
                warn!("polling paused until credentials are replaced");
                tokio::select! {
                    _ = self.inner.reauth.notified() => continue,
                    _ = stop.changed() => break,
                }
            }

            tokio::select! {
                _ = self.poll_once() => {}
                _ = stop.changed() => break,
            }
            if self.auth_failed() {
                continue;
            }

            let delay = self.scheduler_status().interval;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.changed() => break,
            }
        }
        debug!("poll loop stopped");
    }

    /// Forces an out-of-schedule tick. Serialized with the scheduled ones.
    pub async fn request_refresh(&self) -> Result<()> {
        self.poll_once().await.map(|_| ())
    }

    /// Runs one scheduler tick: picks the phase, queries, merges, notifies.
    pub async fn poll_once(&self) -> Result<Phase> {
        let _tick = self.inner.poll_lock.lock().await;

        let (phase, zones) = {
            let st = self.state();
            let phase = st
                .scheduler
                .select_phase(Instant::now(), st.active_zones.is_empty());
            let zones: Vec<String> = match phase {
                Phase::Discovery => self.inner.discovery_zones.clone(),
                Phase::Regular => st.active_zones.iter().cloned().collect(),
            };
            (phase, zones)
        };
        let (label, timeout) = match phase {
            Phase::Discovery => ("discovery", self.inner.timing.discovery_timeout),
            Phase::Regular => ("regular", self.inner.timing.regular_timeout),
        };
        debug!(phase = label, zones = ?zones, "polling controller");

        let result = self
            .inner
            .client
            .query(label, zones.iter().map(String::as_str), true, timeout)
            .await;

        match result {
            Ok(raw) => {
                self.apply_poll(phase, &zones, &raw);
                Ok(phase)
            }
            Err(e) => {
                self.handle_poll_failure(&e);
                Err(e)
            }
        }
    }

    fn apply_poll(&self, phase: Phase, zones: &[String], raw: &ParamMap) {
        let now = Instant::now();
        let zones_changed = {
            let mut guard = self.state();
            let st = &mut *guard;

            let before = tracing::enabled!(tracing::Level::DEBUG)
                .then(|| (st.store.zones().clone(), st.store.common().clone()));

            let reporting =
                st.store
                    .apply_poll(raw, zones.iter().map(String::as_str), &mut st.cache, now);

            if let Some((prev_zones, prev_common)) = before {
                for (zone, params) in st.store.zones() {
                    let empty = ParamMap::new();
                    let prev = prev_zones.get(zone).unwrap_or(&empty);
                    let changes = diff_params(prev, params);
                    if !changes.is_empty() {
                        debug!(zone = %zone, changed = changes.len(), "zone parameters changed");
                    }
                }
                let changes = diff_params(&prev_common, st.store.common());
                if !changes.is_empty() {
                    debug!(changed = changes.len(), "common parameters changed");
                }
            }

            let mut zones_changed = None;
            if phase == Phase::Discovery {
                let next = st.scheduler.reconcile_zones(&st.active_zones, &reporting);
                if next != st.active_zones {
                    info!(from = ?st.active_zones, to = ?next, "active zones changed");
                    st.active_zones = next.clone();
                    zones_changed = Some(next);
                }
            }

            // Active zones inside their miss grace keep their last data.
            st.store.retain_zones(&st.active_zones);

            st.scheduler.record_success(phase, now);
            st.last_update_success = true;
            st.auth_failed = false;
            zones_changed
        };

        if let Some(zones) = zones_changed {
            self.emit(CoordinatorEvent::ZonesChanged(zones));
        }
        self.notify_listeners();
    }

    fn handle_poll_failure(&self, err: &Error) {
        {
            let mut st = self.state();
            st.last_update_success = false;
            if err.is_auth() {
                st.auth_failed = true;
            } else {
                st.scheduler.record_failure();
            }
        }
        if err.is_auth() {
            error!("controller rejected the API key; re-authentication required");
            self.emit(CoordinatorEvent::AuthFailed);
        } else {
            warn!(error = %err, "poll failed");
            self.emit(CoordinatorEvent::UpdateFailed(err.to_string()));
        }
        self.notify_listeners();
    }

    /// Installs a new API key after an auth failure and resumes polling with a
    /// discovery phase.
    pub fn reauthenticate(&self, api_key: Option<String>) {
        let api_key = api_key.filter(|k| !k.trim().is_empty());
        self.inner.client.set_api_key(api_key);
        {
            let mut st = self.state();
            st.auth_failed = false;
            st.scheduler.force_discovery();
        }
        info!("credentials replaced, resuming polling");
        self.inner.reauth.notify_one();
    }

    /// Stops the poll loop and aborts follow-up and firmware tasks.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
        if let Some(fw) = lock(&self.inner.firmware).take() {
            fw.abort();
        }
        debug!("coordinator shut down");
    }

    pub(crate) fn track(&self, task: AbortHandle) {
        let mut tasks = lock(&self.inner.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    // -- Commands --

    /// Sends `command` (`param=value` pairs joined by `&`). `true` when the
    /// controller confirmed it or an identical command is already in flight.
    pub async fn send_command(&self, command: &str) -> bool {
        match self.try_send_command(command).await {
            Ok(CommandOutcome::Applied) => true,
            Ok(CommandOutcome::Debounced(ok)) => ok,
            Err(e) => {
                error!(command, error = %e, "command failed");
                false
            }
        }
    }

    /// Like [`Coordinator::send_command`] but keeps the failure reason.
    pub async fn try_send_command(&self, command: &str) -> Result<CommandOutcome> {
        let command = command.trim().trim_matches('&');
        if command_pairs(command).next().is_none() {
            return Err(Error::InvalidCommand(command.to_string()));
        }

        let sent_at = Instant::now();
        let debounce = self.state().debouncer.check(command, sent_at);
        if let Debounce::Suppressed(ok) = debounce {
            debug!(command, "duplicate command inside debounce window, not re-sent");
            return Ok(CommandOutcome::Debounced(ok));
        }

        debug!(command, "sending command");
        let result = self
            .inner
            .client
            .action(command, self.inner.timing.command_timeout)
            .await;

        {
            let mut guard = self.state();
            let st = &mut *guard;
            st.debouncer.finish(command, sent_at, result.is_ok());
            if let Ok(response) = &result {
                for (key, value) in confirmed_values(response) {
                    debug!(key = %key, value = %value, "confirmed by controller");
                    st.cache.put(key.clone(), value.clone(), sent_at);
                }
                st.store.rebuild(&mut st.cache, Instant::now());
            }
        }

        match result {
            Ok(_) => {
                self.notify_listeners();
                self.schedule_preset_follow_up(command);
                Ok(CommandOutcome::Applied)
            }
            Err(e) => {
                if e.is_auth() {
                    self.emit(CoordinatorEvent::AuthFailed);
                }
                Err(e)
            }
        }
    }

    fn schedule_preset_follow_up(&self, command: &str) {
        let zones = preset_zones(command, self.inner.discovery_zones.iter());
        if zones.is_empty() {
            return;
        }
        let coordinator = self.clone();
        let handle = tokio::spawn(async move { coordinator.preset_follow_up(zones).await });
        self.track(handle.abort_handle());
    }

    /// The controller recomputes e.g. `target_temp` after a preset switch
    /// without echoing it, so re-read the touched zones a little later.
    async fn preset_follow_up(&self, zones: BTreeSet<String>) {
        let timing = &self.inner.timing;
        tokio::time::sleep(timing.preset_follow_up_delay).await;
        debug!(zones = ?zones, "re-reading zones after preset change");

        let raw = match self
            .inner
            .client
            .query(
                "follow-up",
                zones.iter().map(String::as_str),
                false,
                timing.follow_up_timeout,
            )
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "follow-up query after preset change failed");
                return;
            }
        };

        let now = Instant::now();
        let updated = {
            let mut guard = self.state();
            let st = &mut *guard;
            let mut updated = 0;
            for zone in &zones {
                for (param, value) in zone_params(&raw, zone) {
                    if FOLLOW_UP_PARAMS.contains(&param.as_str()) {
                        st.cache.put(format!("{zone}_{param}"), value, now);
                        updated += 1;
                    }
                }
            }
            if updated > 0 {
                st.store.rebuild(&mut st.cache, now);
            }
            updated
        };

        if updated > 0 {
            info!(zones = ?zones, params = updated, "refreshed zone data after preset change");
            self.notify_listeners();
        }
    }

    fn check_zone(&self, zone: &str) -> Result<()> {
        if self.inner.discovery_zones.iter().any(|z| z == zone) {
            Ok(())
        } else {
            Err(Error::UnknownZone(zone.to_string()))
        }
    }

    async fn send_zone_command(&self, zone: &str, command: impl FnOnce() -> String) -> bool {
        if let Err(e) = self.check_zone(zone) {
            error!(error = %e, "command not sent");
            return false;
        }
        self.send_command(&command()).await
    }

    /// Clamped to the zone's limits and snapped to its step before sending.
    pub async fn set_target_temperature(&self, zone: &str, celsius: f64) -> bool {
        let target = self.zone_settings(zone).normalize_target(celsius);
        self.send_zone_command(zone, || target_temp_command(zone, target))
            .await
    }

    pub async fn set_hvac_mode(&self, zone: &str, mode: HvacMode) -> bool {
        self.send_zone_command(zone, || power_command(zone, mode != HvacMode::Off))
            .await
    }

    pub async fn set_preset(&self, zone: &str, preset: PresetMode) -> bool {
        self.send_zone_command(zone, || preset_command(zone, preset))
            .await
    }

    pub async fn set_summer_mode(&self, on: bool) -> bool {
        self.send_command(&summer_mode_command(on)).await
    }

    /// Relay outputs are numbered 1..=8.
    pub async fn set_output(&self, output: u8, on: bool) -> bool {
        if !(1..=8).contains(&output) {
            error!(output, "relay output out of range");
            return false;
        }
        self.send_command(&output_command(output, on)).await
    }
}
