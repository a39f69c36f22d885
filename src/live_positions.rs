// Live train positions from the real-time vehicle endpoint.
//
// Two upstream contracts exist:
// - VehicleMap (current): one GET returning `{ "<vehicle id>": { line_number,
//   position: { latitude, longitude, bearing?, speed? }, status?, trip_id?,
//   timestamp?, vehicle_id? }, ... }`.
// - Journeys (older API generation): GET `<url>` for `[{ journey_id, line_number,
//   vehicle_id? }]` (or `{ "journeys": [...] }`), then GET `<url>/<journey_id>` for
//   each journey; the first listed stop is taken as the vehicle position.
//
// Results are cached for a few seconds only. Empty results and failures are never
// cached, so the next request polls again.

use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache_store::{CacheStore, TRAIN_POSITIONS_KEY};
use crate::config::{LiveApiVariant, LiveConfig};
use crate::error::LiveFetchError;
use crate::metro_models::{current_timestamp, is_valid_coordinate, VehiclePosition};
use crate::single_flight::SingleFlight;
use crate::upstream::Upstream;

const DEFAULT_BEARING: f64 = 0.0;
const DEFAULT_SPEED: f64 = 35.0;

// ============================================================================
// Upstream shapes
// ============================================================================

#[derive(Debug, Deserialize)]
struct VehicleRecord {
    #[serde(deserialize_with = "string_or_number")]
    line_number: String,
    position: RecordPosition,
    status: Option<String>,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    trip_id: Option<String>,
    timestamp: Option<i64>,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    vehicle_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecordPosition {
    latitude: f64,
    longitude: f64,
    bearing: Option<f64>,
    speed: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct JourneySummary {
    #[serde(deserialize_with = "string_or_number")]
    journey_id: String,
    #[serde(deserialize_with = "string_or_number")]
    line_number: String,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    vehicle_id: Option<String>,
}

/// Entries stay raw so one undecodable journey does not sink the list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JourneyList {
    Bare(Vec<serde_json::Value>),
    Wrapped { journeys: Vec<serde_json::Value> },
}

#[derive(Debug, Deserialize)]
struct JourneyDetail {
    #[serde(default)]
    stops: Vec<JourneyStop>,
    status: Option<String>,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    trip_id: Option<String>,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    vehicle_id: Option<String>,
    bearing: Option<f64>,
    speed: Option<f64>,
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct JourneyStop {
    latitude: f64,
    longitude: f64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TextOrNumber {
    Text(String),
    Number(i64),
}

impl From<TextOrNumber> for String {
    fn from(raw: TextOrNumber) -> Self {
        match raw {
            TextOrNumber::Text(text) => text.trim().to_string(),
            TextOrNumber::Number(number) => number.to_string(),
        }
    }
}

/// Line numbers and ids show up both as `"50"` and as `50`.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    TextOrNumber::deserialize(deserializer).map(String::from)
}

/// As `string_or_number`, for fields that may be absent or `null`.
fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<TextOrNumber>::deserialize(deserializer)?.map(String::from))
}

/// One vehicle observation before defaults are applied.
struct Sighting {
    route_id: String,
    vehicle_id: String,
    latitude: f64,
    longitude: f64,
    bearing: Option<f64>,
    speed: Option<f64>,
    status: Option<String>,
    trip_id: Option<String>,
    timestamp: Option<i64>,
}

impl Sighting {
    fn normalize(self, fetched_at: i64) -> Option<VehiclePosition> {
        if !is_valid_coordinate(self.latitude, self.longitude) {
            debug!(
                vehicle = %self.vehicle_id,
                latitude = self.latitude,
                longitude = self.longitude,
                "Skipping vehicle with out-of-range position"
            );
            return None;
        }

        let trip_id = self
            .trip_id
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| format!("trip_{}_{}", self.route_id, self.vehicle_id));

        Some(VehiclePosition {
            id: format!("train_{}_{}", self.route_id, self.vehicle_id),
            route_id: self.route_id,
            latitude: self.latitude,
            longitude: self.longitude,
            bearing: Some(self.bearing.unwrap_or(DEFAULT_BEARING).rem_euclid(360.0)),
            speed: Some(self.speed.unwrap_or(DEFAULT_SPEED)),
            status: self.status,
            timestamp: self.timestamp.unwrap_or(fetched_at),
            vehicle_id: self.vehicle_id,
            trip_id: Some(trip_id),
        })
    }
}

// ============================================================================
// Fetcher
// ============================================================================

pub struct LivePositionFetcher {
    cache: Arc<CacheStore>,
    upstream: Arc<dyn Upstream>,
    config: LiveConfig,
    polls: SingleFlight<Vec<VehiclePosition>>,
}

impl LivePositionFetcher {
    pub fn new(cache: Arc<CacheStore>, upstream: Arc<dyn Upstream>, config: LiveConfig) -> Self {
        LivePositionFetcher {
            cache,
            upstream,
            config,
            polls: SingleFlight::new(),
        }
    }

    /// Never fails; errors are logged and yield an empty list.
    pub fn get_positions(&self) -> Vec<VehiclePosition> {
        if let Some(positions) = self.cache.get::<Vec<VehiclePosition>>(TRAIN_POSITIONS_KEY) {
            return positions;
        }

        self.polls.run(TRAIN_POSITIONS_KEY, || match self.poll() {
            Ok(positions) if positions.is_empty() => {
                debug!("Live endpoint reported no in-scope vehicles");
                positions
            }
            Ok(positions) => {
                self.cache.set(TRAIN_POSITIONS_KEY, &positions, Some(self.config.ttl));
                debug!(count = positions.len(), "Live positions refreshed");
                positions
            }
            Err(e) => {
                warn!(error = %e, "Live position fetch failed");
                Vec::new()
            }
        })
    }

    fn poll(&self) -> Result<Vec<VehiclePosition>, LiveFetchError> {
        let url = self.config.url.as_deref().ok_or(LiveFetchError::NotConfigured)?;
        let fetched_at = current_timestamp();

        let sightings = match self.config.variant {
            LiveApiVariant::VehicleMap => self.poll_vehicle_map(url)?,
            LiveApiVariant::Journeys => self.poll_journeys(url)?,
        };

        Ok(sightings
            .into_iter()
            .filter_map(|s| s.normalize(fetched_at))
            .collect())
    }

    fn in_scope(&self, line_number: &str) -> bool {
        self.config.route_whitelist.iter().any(|l| l == line_number)
    }

    fn poll_vehicle_map(&self, url: &str) -> Result<Vec<Sighting>, LiveFetchError> {
        let body = self.upstream.get(url, self.config.timeout)?;
        let records: BTreeMap<String, serde_json::Value> = serde_json::from_slice(&body)
            .map_err(|e| LiveFetchError::Decode(format!("vehicle map: {}", e)))?;

        let sightings = records
            .into_iter()
            .filter_map(|(key, raw)| {
                let record: VehicleRecord = match serde_json::from_value(raw) {
                    Ok(record) => record,
                    Err(e) => {
                        debug!(vehicle = %key, error = %e, "Skipping undecodable vehicle record");
                        return None;
                    }
                };
                if !self.in_scope(&record.line_number) {
                    return None;
                }
                Some(Sighting {
                    route_id: record.line_number,
                    vehicle_id: record.vehicle_id.unwrap_or(key),
                    latitude: record.position.latitude,
                    longitude: record.position.longitude,
                    bearing: record.position.bearing,
                    speed: record.position.speed,
                    status: record.status,
                    trip_id: record.trip_id,
                    timestamp: record.timestamp,
                })
            })
            .collect();

        Ok(sightings)
    }

    fn poll_journeys(&self, url: &str) -> Result<Vec<Sighting>, LiveFetchError> {
        let body = self.upstream.get(url, self.config.timeout)?;
        let list = serde_json::from_slice::<JourneyList>(&body)
            .map_err(|e| LiveFetchError::Decode(format!("journey list: {}", e)))?;
        let (JourneyList::Bare(entries) | JourneyList::Wrapped { journeys: entries }) = list;

        let journeys = entries.into_iter().filter_map(|raw| {
            match serde_json::from_value::<JourneySummary>(raw) {
                Ok(journey) => Some(journey),
                Err(e) => {
                    debug!(error = %e, "Skipping undecodable journey");
                    None
                }
            }
        });

        let base = url.trim_end_matches('/');
        let mut sightings = Vec::new();

        for journey in journeys.filter(|j| self.in_scope(&j.line_number)) {
            let detail_url = format!("{}/{}", base, journey.journey_id);
            let detail = match self.fetch_journey(&detail_url) {
                Ok(detail) => detail,
                Err(e) => {
                    debug!(journey = %journey.journey_id, error = %e, "Skipping journey");
                    continue;
                }
            };
            let Some(first_stop) = detail.stops.first() else {
                debug!(journey = %journey.journey_id, "Journey has no stops, skipping");
                continue;
            };

            let vehicle_id = detail
                .vehicle_id
                .clone()
                .or(journey.vehicle_id)
                .unwrap_or_else(|| journey.journey_id.clone());

            sightings.push(Sighting {
                route_id: journey.line_number,
                vehicle_id,
                latitude: first_stop.latitude,
                longitude: first_stop.longitude,
                bearing: detail.bearing,
                speed: detail.speed,
                status: detail.status,
                trip_id: detail.trip_id,
                timestamp: detail.timestamp,
            });
        }

        Ok(sightings)
    }

    fn fetch_journey(&self, url: &str) -> Result<JourneyDetail, LiveFetchError> {
        let body = self.upstream.get(url, self.config.timeout)?;
        serde_json::from_slice(&body)
            .map_err(|e| LiveFetchError::Decode(format!("journey detail: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::tests::{degraded_store, memory_store};
    use crate::config::Config;
    use crate::error::FetchError;
    use crate::upstream::testing::FakeUpstream;
    use serde_json::json;
    use std::thread;
    use std::time::Duration;

    const LIVE_URL: &str = "http://live.test/vehicles";

    fn live_config(variant: LiveApiVariant) -> LiveConfig {
        LiveConfig {
            url: Some(LIVE_URL.to_string()),
            variant,
            ..Config::default().live
        }
    }

    fn fetcher(
        cache: CacheStore,
        upstream: Arc<FakeUpstream>,
        variant: LiveApiVariant,
    ) -> LivePositionFetcher {
        LivePositionFetcher::new(Arc::new(cache), upstream, live_config(variant))
    }

    fn one_vehicle_on_50() -> serde_json::Value {
        json!({
            "GVB-3021": {
                "line_number": "50",
                "position": {
                    "latitude": 52.3467,
                    "longitude": 4.9178,
                    "bearing": 90.0,
                    "speed": 42.5
                },
                "status": "IN_TRANSIT_TO",
                "trip_id": "T50-0800",
                "timestamp": 1_700_000_000
            }
        })
    }

    #[test]
    fn transport_error_yields_empty_and_writes_nothing() {
        let upstream = Arc::new(FakeUpstream::new());
        upstream.fail(LIVE_URL, FetchError::Transport("timed out".to_string()));
        let fetcher = fetcher(memory_store(), Arc::clone(&upstream), LiveApiVariant::VehicleMap);

        assert!(fetcher.get_positions().is_empty());
        assert!(fetcher.cache.get::<Vec<VehiclePosition>>(TRAIN_POSITIONS_KEY).is_none());
        assert_eq!(upstream.calls(), 1);
    }

    #[test]
    fn vehicle_map_is_filtered_and_defaulted() {
        let upstream = Arc::new(FakeUpstream::new());
        let body = json!({
            "A": {"line_number": 51, "position": {"latitude": 52.30, "longitude": 4.95}},
            "B": {"line_number": "26", "position": {"latitude": 52.31, "longitude": 4.96}},
            "C": {"line_number": "52", "position": "garbage"},
            "D": {"line_number": "53", "vehicle_id": "GVB-9",
                  "position": {"latitude": 52.32, "longitude": 4.97, "bearing": -90.0}}
        });
        upstream.respond(LIVE_URL, body.to_string());
        let fetcher = fetcher(memory_store(), upstream, LiveApiVariant::VehicleMap);

        let before = current_timestamp();
        let positions = fetcher.get_positions();
        assert_eq!(positions.len(), 2);

        let a = &positions[0];
        assert_eq!(a.route_id, "51");
        assert_eq!(a.vehicle_id, "A");
        assert_eq!(a.id, "train_51_A");
        assert_eq!(a.bearing, Some(0.0));
        assert_eq!(a.speed, Some(35.0));
        assert_eq!(a.trip_id.as_deref(), Some("trip_51_A"));
        assert!(a.timestamp >= before);
        assert!(a.status.is_none());

        let d = &positions[1];
        assert_eq!(d.vehicle_id, "GVB-9");
        assert_eq!(d.bearing, Some(270.0));
    }

    #[test]
    fn positions_are_cached_until_the_ttl_lapses() {
        let upstream = Arc::new(FakeUpstream::new());
        upstream.respond(LIVE_URL, one_vehicle_on_50().to_string());
        let fetcher = fetcher(memory_store(), Arc::clone(&upstream), LiveApiVariant::VehicleMap);

        let first = fetcher.get_positions();
        let second = fetcher.get_positions();
        assert_eq!(first, second);
        assert_eq!(first[0].timestamp, 1_700_000_000);
        assert_eq!(first[0].trip_id.as_deref(), Some("T50-0800"));
        assert_eq!(upstream.calls(), 1);
    }

    #[test]
    fn empty_results_are_not_cached() {
        let upstream = Arc::new(FakeUpstream::new());
        upstream.respond(LIVE_URL, "{}");
        let fetcher = fetcher(memory_store(), Arc::clone(&upstream), LiveApiVariant::VehicleMap);

        assert!(fetcher.get_positions().is_empty());
        assert!(fetcher.get_positions().is_empty());
        assert_eq!(upstream.calls(), 2);
    }

    #[test]
    fn unconfigured_endpoint_yields_empty() {
        let config = LiveConfig {
            url: None,
            ..Config::default().live
        };
        let upstream = Arc::new(FakeUpstream::new());
        let fetcher = LivePositionFetcher::new(Arc::new(memory_store()), upstream.clone(), config);
        assert!(fetcher.get_positions().is_empty());
        assert_eq!(upstream.calls(), 0);
    }

    #[test]
    fn degraded_cache_still_returns_live_positions() {
        let upstream = Arc::new(FakeUpstream::new());
        upstream.respond(LIVE_URL, one_vehicle_on_50().to_string());
        let fetcher = fetcher(degraded_store(), upstream, LiveApiVariant::VehicleMap);
        assert_eq!(fetcher.get_positions().len(), 1);
    }

    #[test]
    fn journeys_variant_takes_first_stop_and_skips_failures() {
        let upstream = Arc::new(FakeUpstream::new());
        upstream.respond(
            LIVE_URL,
            json!({"journeys": [
                {"journey_id": 11, "line_number": "50", "vehicle_id": "GVB-1"},
                {"journey_id": 12, "line_number": "26"},
                {"journey_id": 13, "line_number": "54"}
            ]})
            .to_string(),
        );
        upstream.respond(
            "http://live.test/vehicles/11",
            json!({
                "stops": [
                    {"latitude": 52.378, "longitude": 4.900},
                    {"latitude": 52.372, "longitude": 4.902}
                ],
                "status": "STOPPED_AT"
            })
            .to_string(),
        );
        // Journey 13 has no detail response: transport failure, skipped.
        let fetcher = fetcher(memory_store(), Arc::clone(&upstream), LiveApiVariant::Journeys);

        let positions = fetcher.get_positions();
        assert_eq!(positions.len(), 1);
        let p = &positions[0];
        assert_eq!(p.route_id, "50");
        assert_eq!(p.vehicle_id, "GVB-1");
        assert_eq!((p.latitude, p.longitude), (52.378, 4.900));
        assert_eq!(p.status.as_deref(), Some("STOPPED_AT"));
        assert_eq!(upstream.calls(), 3);
    }

    #[test]
    fn journeys_variant_accepts_bare_list() {
        let upstream = Arc::new(FakeUpstream::new());
        upstream.respond(LIVE_URL, json!([{"journey_id": "J1", "line_number": 52}]).to_string());
        upstream.respond(
            "http://live.test/vehicles/J1",
            json!({"stops": [{"latitude": 52.33, "longitude": 4.89}]}).to_string(),
        );
        let fetcher = fetcher(memory_store(), upstream, LiveApiVariant::Journeys);

        let positions = fetcher.get_positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].vehicle_id, "J1");
        assert_eq!(positions[0].route_id, "52");
    }

    #[test]
    fn numeric_vehicle_and_trip_ids_are_accepted() {
        let upstream = Arc::new(FakeUpstream::new());
        let body = json!({
            "3021": {
                "line_number": 50,
                "vehicle_id": 3021,
                "trip_id": 880_112,
                "position": {"latitude": 52.3467, "longitude": 4.9178}
            },
            "3022": {
                "line_number": "51",
                "vehicle_id": null,
                "position": {"latitude": 52.35, "longitude": 4.92}
            }
        });
        upstream.respond(LIVE_URL, body.to_string());
        let fetcher = fetcher(memory_store(), upstream, LiveApiVariant::VehicleMap);

        let positions = fetcher.get_positions();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].vehicle_id, "3021");
        assert_eq!(positions[0].id, "train_50_3021");
        assert_eq!(positions[0].trip_id.as_deref(), Some("880112"));
        assert_eq!(positions[1].vehicle_id, "3022");
        assert_eq!(positions[1].trip_id.as_deref(), Some("trip_51_3022"));
    }

    #[test]
    fn journeys_variant_skips_only_undecodable_entries() {
        let upstream = Arc::new(FakeUpstream::new());
        upstream.respond(
            LIVE_URL,
            json!([
                {"journey_id": 1, "line_number": "50"},
                {"journey_id": 2, "line_number": "51", "vehicle_id": 77},
                {"journey_id": 3},
                {"journey_id": 4, "line_number": "53", "vehicle_id": ["not", "an", "id"]}
            ])
            .to_string(),
        );
        upstream.respond(
            "http://live.test/vehicles/1",
            json!({"stops": [{"latitude": 52.30, "longitude": 4.90}]}).to_string(),
        );
        upstream.respond(
            "http://live.test/vehicles/2",
            json!({"stops": [{"latitude": 52.31, "longitude": 4.91}], "trip_id": 5151})
                .to_string(),
        );
        let fetcher = fetcher(memory_store(), Arc::clone(&upstream), LiveApiVariant::Journeys);

        let positions = fetcher.get_positions();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].vehicle_id, "1");
        assert_eq!(positions[1].vehicle_id, "77");
        assert_eq!(positions[1].trip_id.as_deref(), Some("5151"));
        assert_eq!(upstream.calls(), 3);
    }

    #[test]
    fn live_requests_use_the_live_timeout() {
        let vehicles = Arc::new(FakeUpstream::new());
        vehicles.respond(LIVE_URL, one_vehicle_on_50().to_string());
        let by_map = fetcher(memory_store(), Arc::clone(&vehicles), LiveApiVariant::VehicleMap);
        assert_eq!(by_map.get_positions().len(), 1);
        assert_eq!(vehicles.timeout_for(LIVE_URL), Some(Duration::from_secs(5)));

        let journeys = Arc::new(FakeUpstream::new());
        journeys.respond(LIVE_URL, json!([{"journey_id": 9, "line_number": "50"}]).to_string());
        journeys.respond(
            "http://live.test/vehicles/9",
            json!({"stops": [{"latitude": 52.30, "longitude": 4.90}]}).to_string(),
        );
        let by_journey = fetcher(memory_store(), Arc::clone(&journeys), LiveApiVariant::Journeys);
        assert_eq!(by_journey.get_positions().len(), 1);
        assert_eq!(journeys.timeout_for(LIVE_URL), Some(Duration::from_secs(5)));
        assert_eq!(
            journeys.timeout_for("http://live.test/vehicles/9"),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn seeded_empty_entry_is_served_until_it_expires() {
        let upstream = Arc::new(FakeUpstream::new());
        upstream.respond(LIVE_URL, one_vehicle_on_50().to_string());
        let cache = memory_store();
        let seeded: Vec<VehiclePosition> = Vec::new();
        assert!(cache.set(TRAIN_POSITIONS_KEY, &seeded, Some(Duration::from_secs(3))));
        let fetcher = fetcher(cache, Arc::clone(&upstream), LiveApiVariant::VehicleMap);

        assert!(fetcher.get_positions().is_empty());
        assert_eq!(upstream.calls(), 0);

        thread::sleep(Duration::from_secs(4));

        let positions = fetcher.get_positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].route_id, "50");
        assert_eq!(upstream.calls(), 1);
    }
}
