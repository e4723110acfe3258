use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use crate::cache::ConfirmedCache;
use crate::protocol::{common_params, is_common_key, split_zone_key, zone_params};
use crate::types::ParamMap;

/// Last polled snapshot plus the view readers see: the snapshot with fresh
/// confirmed values laid over it.
#[derive(Debug, Default)]
pub(crate) struct ZoneStore {
    base_zones: BTreeMap<String, ParamMap>,
    base_common: ParamMap,
    /// Zones that had data in the last successful poll.
    reporting: BTreeSet<String>,
    zones: BTreeMap<String, ParamMap>,
    common: ParamMap,
}

impl ZoneStore {
    /// Merges a fresh poll of `polled` zones into the snapshot. Returns the
    /// zones that reported at least one parameter. Zones that did not report
    /// keep their last data until [`ZoneStore::retain_zones`] lets them go.
    pub fn apply_poll<'a>(
        &mut self,
        raw: &ParamMap,
        polled: impl IntoIterator<Item = &'a str>,
        cache: &mut ConfirmedCache,
        now: Instant,
    ) -> BTreeSet<String> {
        let fresh: BTreeMap<String, ParamMap> = polled
            .into_iter()
            .filter_map(|zone| {
                let params = zone_params(raw, zone);
                (!params.is_empty()).then(|| (zone.to_string(), params))
            })
            .collect();
        self.reporting = fresh.keys().cloned().collect();
        self.base_zones.extend(fresh);
        self.base_common = common_params(raw);
        self.rebuild(cache, now);
        self.reporting.clone()
    }

    /// Drops the data of every zone that neither reported in the last poll
    /// nor is in `keep`.
    pub fn retain_zones(&mut self, keep: &BTreeSet<String>) {
        let reporting = &self.reporting;
        self.base_zones
            .retain(|zone, _| reporting.contains(zone) || keep.contains(zone));
        self.zones
            .retain(|zone, _| reporting.contains(zone) || keep.contains(zone));
    }

    /// Re-derives the view from the last snapshot without touching the network.
    pub fn rebuild(&mut self, cache: &mut ConfirmedCache, now: Instant) {
        cache.sweep(now);

        let mut zones: BTreeMap<String, ParamMap> = self
            .base_zones
            .iter()
            .map(|(zone, params)| {
                let merged = params
                    .iter()
                    .map(|(param, polled)| {
                        let key = format!("{zone}_{param}");
                        (param.clone(), cache.resolve(&key, polled.clone(), now))
                    })
                    .collect();
                (zone.clone(), merged)
            })
            .collect();

        let mut common: ParamMap = self
            .base_common
            .iter()
            .map(|(key, polled)| (key.clone(), cache.resolve(key, polled.clone(), now)))
            .collect();

        // Confirmed keys the last poll did not carry at all.
        for (key, value) in cache.fresh_entries(now) {
            if let Some((zone, param)) = split_zone_key(key, self.base_zones.keys()) {
                if let Some(params) = zones.get_mut(zone) {
                    params
                        .entry(param.to_string())
                        .or_insert_with(|| value.clone());
                }
            } else if is_common_key(key) {
                common.entry(key.to_string()).or_insert_with(|| value.clone());
            }
        }

        self.zones = zones;
        self.common = common;
    }

    pub fn zone(&self, zone: &str) -> Option<&ParamMap> {
        self.zones.get(zone)
    }

    pub fn zones(&self) -> &BTreeMap<String, ParamMap> {
        &self.zones
    }

    pub fn common(&self) -> &ParamMap {
        &self.common
    }

    pub fn reporting(&self) -> impl Iterator<Item = &String> {
        self.reporting.iter()
    }

    pub fn is_reporting(&self, zone: &str) -> bool {
        self.reporting.contains(zone)
    }
}
