// Tiered resolution of the static network: cache, then feed ingestion, then the
// built-in degraded line table.
//
// Route and station caches are filled together by one ingestion run, so a forced
// station refresh is a full network refresh.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cache_store::{CacheStore, METRO_LINES_KEY, STATIONS_KEY};
use crate::config::GeoPoint;
use crate::error::Result;
use crate::feed_ingest::FeedIngestor;
use crate::geometry::placeholder_loop;
use crate::metro_models::{NetworkSnapshot, Route, RouteMap, StationMap};
use crate::single_flight::SingleFlight;

/// Lines served when the feed cannot be ingested: id, display colour.
const DEGRADED_LINES: [(&str, &str); 5] = [
    ("50", "FF4500"),
    ("51", "32CD32"),
    ("52", "1E90FF"),
    ("53", "FFD700"),
    ("54", "9932CC"),
];

const NETWORK_FLIGHT: &str = "network";

pub struct NetworkResolver {
    cache: Arc<CacheStore>,
    ingestor: FeedIngestor,
    ttl: Duration,
    reference_point: GeoPoint,
    refreshes: SingleFlight<Result<NetworkSnapshot>>,
}

impl NetworkResolver {
    pub fn new(
        cache: Arc<CacheStore>,
        ingestor: FeedIngestor,
        ttl: Duration,
        reference_point: GeoPoint,
    ) -> Self {
        NetworkResolver {
            cache,
            ingestor,
            ttl,
            reference_point,
            refreshes: SingleFlight::new(),
        }
    }

    /// Never fails: the last tier is the degraded line table.
    pub fn get_routes(&self, force_refresh: bool) -> RouteMap {
        if !force_refresh {
            if let Some(routes) = self.cache.get::<RouteMap>(METRO_LINES_KEY) {
                return routes;
            }
        }

        match self.refresh() {
            Ok(snapshot) => snapshot.routes,
            Err(e) => {
                warn!(
                    kind = e.kind(),
                    error = %e,
                    "Feed ingestion failed, serving degraded line table"
                );
                degraded_routes(self.reference_point)
            }
        }
    }

    /// An empty map means the topology is unavailable, not that there are no stations.
    pub fn get_stations(&self, force_refresh: bool) -> StationMap {
        if !force_refresh {
            if let Some(stations) = self.cache.get::<StationMap>(STATIONS_KEY) {
                return stations;
            }
        }

        match self.refresh() {
            Ok(snapshot) => snapshot.stations,
            Err(e) => {
                warn!(
                    kind = e.kind(),
                    error = %e,
                    "Feed ingestion failed, no station data available"
                );
                StationMap::new()
            }
        }
    }

    /// Ingests and publishes a fresh snapshot. Concurrent callers share one run.
    fn refresh(&self) -> Result<NetworkSnapshot> {
        self.refreshes.run(NETWORK_FLIGHT, || {
            let snapshot = self.ingestor.ingest()?;
            let routes_cached = self.cache.set(METRO_LINES_KEY, &snapshot.routes, Some(self.ttl));
            let stations_cached = self.cache.set(STATIONS_KEY, &snapshot.stations, Some(self.ttl));
            info!(
                routes = snapshot.routes.len(),
                stations = snapshot.stations.len(),
                routes_cached,
                stations_cached,
                "Network snapshot refreshed"
            );
            Ok(snapshot)
        })
    }
}

/// The fixed fallback table with placeholder geometry and no stations.
pub fn degraded_routes(reference_point: GeoPoint) -> RouteMap {
    DEGRADED_LINES
        .iter()
        .map(|(id, color)| {
            let number = id.parse().unwrap_or_default();
            let route = Route {
                id: id.to_string(),
                name: id.to_string(),
                color: color.to_string(),
                route_id: id.to_string(),
                shape: placeholder_loop(reference_point, number),
                stations: Vec::new(),
            };
            (id.to_string(), route)
        })
        .collect()
}
