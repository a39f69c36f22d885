// Static feed ingestion: download the GTFS archive, unpack it into a scratch
// directory, and assemble the metro Route/Station snapshot.
//
// Feed tables read:
// - agency.txt     operator lookup by name
// - routes.txt     metro routes of the operator, restricted to the line whitelist
// - stops.txt      boardable stops and stations
// - shapes.txt     line geometry
// - stop_times.txt station/route linkage (stop-times association only)
// - trips.txt      optional; maps routes to shapes and trips to routes

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::config::{FeedConfig, StationAssociation};
use crate::error::{IngestionError, Result};
use crate::geometry::{placeholder_loop, route_number};
use crate::metro_models::{is_valid_coordinate, NetworkSnapshot, Route, Station};
use crate::upstream::Upstream;

const AGENCY_FILE: &str = "agency.txt";
const ROUTES_FILE: &str = "routes.txt";
const STOPS_FILE: &str = "stops.txt";
const SHAPES_FILE: &str = "shapes.txt";
const STOP_TIMES_FILE: &str = "stop_times.txt";
const TRIPS_FILE: &str = "trips.txt";

const REQUIRED_FILES: [&str; 5] =
    [AGENCY_FILE, ROUTES_FILE, STOPS_FILE, SHAPES_FILE, STOP_TIMES_FILE];
const DEFAULT_ROUTE_COLOR: &str = "FFFFFF";

// ============================================================================
// Feed rows
// ============================================================================

#[derive(Debug, Deserialize)]
struct AgencyRow {
    #[serde(default)]
    agency_id: String,
    #[serde(default)]
    agency_name: String,
}

#[derive(Debug, Deserialize)]
struct RouteRow {
    route_id: String,
    #[serde(default)]
    route_type: String,
    #[serde(default)]
    agency_id: String,
    #[serde(default)]
    route_short_name: String,
    #[serde(default)]
    route_color: String,
}

#[derive(Debug, Deserialize)]
struct StopRow {
    stop_id: String,
    #[serde(default)]
    stop_name: String,
    #[serde(default)]
    stop_lat: String,
    #[serde(default)]
    stop_lon: String,
    #[serde(default)]
    location_type: String,
    #[serde(default)]
    parent_station: String,
}

#[derive(Debug, Deserialize)]
struct ShapeRow {
    shape_id: String,
    shape_pt_lat: String,
    shape_pt_lon: String,
    shape_pt_sequence: String,
}

#[derive(Debug, Deserialize)]
struct TripRow {
    route_id: String,
    trip_id: String,
    #[serde(default)]
    shape_id: String,
}

#[derive(Debug, Deserialize)]
struct StopTimeRow {
    trip_id: String,
    stop_id: String,
}

/// An in-scope route before stations and geometry are attached.
#[derive(Debug, Clone)]
struct SelectedRoute {
    name: String,
    color: String,
}

// ============================================================================
// Ingestor
// ============================================================================

pub struct FeedIngestor {
    config: FeedConfig,
    upstream: Arc<dyn Upstream>,
}

impl FeedIngestor {
    pub fn new(config: FeedConfig, upstream: Arc<dyn Upstream>) -> Self {
        FeedIngestor { config, upstream }
    }

    /// Runs one full ingestion. Either a complete snapshot comes back or nothing does.
    pub fn ingest(&self) -> Result<NetworkSnapshot> {
        info!(url = %self.config.archive_url, "Downloading feed archive");
        let body = self.upstream.get(&self.config.archive_url, self.config.timeout)?;
        info!(size_kb = body.len() / 1024, "Feed archive downloaded, extracting");

        // Dropping `scratch` removes the archive and the unpacked tables.
        let scratch = self.scratch_dir()?;
        let tables = unpack_archive(&body, scratch.path())?;
        let snapshot = self.build_snapshot(&tables)?;

        info!(
            routes = snapshot.routes.len(),
            stations = snapshot.stations.len(),
            "Feed ingestion complete"
        );
        Ok(snapshot)
    }

    fn scratch_dir(&self) -> Result<TempDir> {
        fs::create_dir_all(&self.config.scratch_root).map_err(|e| {
            IngestionError::Archive(format!(
                "cannot create scratch root {}: {}",
                self.config.scratch_root.display(),
                e
            ))
        })?;
        tempfile::Builder::new()
            .prefix("feed-")
            .tempdir_in(&self.config.scratch_root)
            .map_err(|e| IngestionError::Archive(format!("cannot create scratch directory: {}", e)))
    }

    fn build_snapshot(&self, dir: &Path) -> Result<NetworkSnapshot> {
        for name in REQUIRED_FILES {
            if !dir.join(name).is_file() {
                return Err(IngestionError::MissingFile(name.to_string()));
            }
        }

        let operator_id = find_operator_id(dir, &self.config.operator_name)?;
        match &operator_id {
            Some(id) => debug!(
                operator = %self.config.operator_name,
                agency_id = %id,
                "Operator resolved"
            ),
            None => warn!(
                operator = %self.config.operator_name,
                "Operator not found in agency table, accepting all agencies"
            ),
        }

        let routes = self.select_routes(dir, operator_id.as_deref())?;
        if routes.is_empty() {
            return Err(IngestionError::Validation(format!(
                "no in-scope routes (route_type {}, lines {:?})",
                self.config.route_type, self.config.route_whitelist
            )));
        }

        let (mut stations, parents) = select_stations(dir)?;

        let trips = if dir.join(TRIPS_FILE).is_file() {
            let route_ids: HashSet<&str> = routes.keys().map(String::as_str).collect();
            let mut trips = Vec::new();
            for_each_row(&dir.join(TRIPS_FILE), |row: TripRow| {
                if route_ids.contains(row.route_id.as_str()) {
                    trips.push(row);
                }
                Ok(())
            })?;
            Some(trips)
        } else {
            None
        };

        let shapes = self.load_geometry(dir, &routes, trips.as_deref())?;

        match (self.config.station_association, trips.as_deref()) {
            (StationAssociation::StopTimes, Some(trips)) => {
                associate_by_stop_times(dir, &mut stations, &parents, trips)?
            }
            (StationAssociation::StopTimes, None) => {
                warn!("trips.txt missing, marking every station as served by every line");
                associate_all_routes(&mut stations, &routes);
            }
            (StationAssociation::AllRoutes, _) => associate_all_routes(&mut stations, &routes),
        }

        let mut shapes = shapes;
        let routes = routes
            .into_iter()
            .map(|(route_id, selected)| {
                let route_stations = stations
                    .values()
                    .filter(|s| s.routes.iter().any(|r| *r == route_id))
                    .cloned()
                    .collect();
                let shape = shapes.remove(&route_id).unwrap_or_default();
                let route = Route {
                    id: route_id.clone(),
                    name: selected.name,
                    color: selected.color,
                    route_id: route_id.clone(),
                    shape,
                    stations: route_stations,
                };
                (route_id, route)
            })
            .collect();

        Ok(NetworkSnapshot { routes, stations })
    }

    fn select_routes(
        &self,
        dir: &Path,
        operator_id: Option<&str>,
    ) -> Result<BTreeMap<String, SelectedRoute>> {
        let route_type = self.config.route_type.to_string();
        let mut selected = BTreeMap::new();

        for_each_row(&dir.join(ROUTES_FILE), |row: RouteRow| {
            let in_mode = row.route_type.trim() == route_type;
            let in_operator = operator_id.is_none_or(|id| row.agency_id == id);
            let in_whitelist = self
                .config
                .route_whitelist
                .iter()
                .any(|name| *name == row.route_short_name.trim());

            if in_mode && in_operator && in_whitelist {
                let color = row.route_color.trim().trim_start_matches('#');
                let color = if color.is_empty() { DEFAULT_ROUTE_COLOR } else { color };
                selected.insert(
                    row.route_id,
                    SelectedRoute {
                        name: row.route_short_name.trim().to_string(),
                        color: color.to_string(),
                    },
                );
            }
            Ok(())
        })?;

        debug!(count = selected.len(), "In-scope routes selected");
        Ok(selected)
    }

    /// Real shapes where the feed has them, placeholder loops otherwise.
    fn load_geometry(
        &self,
        dir: &Path,
        routes: &BTreeMap<String, SelectedRoute>,
        trips: Option<&[TripRow]>,
    ) -> Result<HashMap<String, Vec<[f64; 2]>>> {
        // route_id -> candidate shape ids
        let mut candidates: HashMap<&str, BTreeSet<String>> = HashMap::new();
        match trips {
            Some(trips) => {
                for trip in trips.iter().filter(|t| !t.shape_id.is_empty()) {
                    candidates
                        .entry(trip.route_id.as_str())
                        .or_default()
                        .insert(trip.shape_id.clone());
                }
            }
            None => {
                for route_id in routes.keys() {
                    candidates
                        .entry(route_id.as_str())
                        .or_default()
                        .insert(route_id.clone());
                }
            }
        }

        let wanted: HashSet<&str> = candidates
            .values()
            .flat_map(|ids| ids.iter().map(String::as_str))
            .collect();

        let mut points: HashMap<String, Vec<(u32, [f64; 2])>> = HashMap::new();
        for_each_row(&dir.join(SHAPES_FILE), |row: ShapeRow| {
            if !wanted.contains(row.shape_id.as_str()) {
                return Ok(());
            }
            let context = format!("shape {}", row.shape_id);
            let latitude = parse_number::<f64>(&row.shape_pt_lat, "shape_pt_lat", &context)?;
            let longitude = parse_number::<f64>(&row.shape_pt_lon, "shape_pt_lon", &context)?;
            let sequence =
                parse_number::<u32>(&row.shape_pt_sequence, "shape_pt_sequence", &context)?;
            if !is_valid_coordinate(latitude, longitude) {
                return Err(IngestionError::Validation(format!(
                    "{} has out-of-range point ({}, {})",
                    context, latitude, longitude
                )));
            }
            points
                .entry(row.shape_id)
                .or_default()
                .push((sequence, [longitude, latitude]));
            Ok(())
        })?;

        let mut geometry = HashMap::new();
        for route_id in routes.keys() {
            let best = candidates
                .get(route_id.as_str())
                .into_iter()
                .flatten()
                .filter_map(|shape_id| points.get(shape_id))
                .fold(None::<&Vec<(u32, [f64; 2])>>, |best, shape| match best {
                    Some(b) if b.len() >= shape.len() => Some(b),
                    _ => Some(shape),
                });

            let shape = match best {
                Some(shape) => {
                    let mut shape = shape.clone();
                    shape.sort_by_key(|(sequence, _)| *sequence);
                    shape.into_iter().map(|(_, point)| point).collect()
                }
                None => {
                    debug!(route = %route_id, "No shape in feed, using placeholder geometry");
                    placeholder_loop(self.config.reference_point, route_number(route_id))
                }
            };
            geometry.insert(route_id.clone(), shape);
        }

        Ok(geometry)
    }
}

// ============================================================================
// Archive and table helpers
// ============================================================================

/// Writes the archive into `scratch` and unpacks it to `scratch/tables`.
fn unpack_archive(body: &[u8], scratch: &Path) -> Result<PathBuf> {
    let archive_path = scratch.join("feed.zip");
    fs::write(&archive_path, body)
        .map_err(|e| IngestionError::Archive(format!("cannot write archive: {}", e)))?;

    let file = fs::File::open(&archive_path)
        .map_err(|e| IngestionError::Archive(format!("cannot reopen archive: {}", e)))?;
    let mut archive = ZipArchive::new(file)?;

    let tables = scratch.join("tables");
    archive.extract(&tables)?;
    debug!(files = archive.len(), dir = %tables.display(), "Feed archive unpacked");
    Ok(tables)
}

/// Streams a header-keyed table row by row.
fn for_each_row<T, F>(path: &Path, mut visit: F) -> Result<()>
where
    T: DeserializeOwned,
    F: FnMut(T) -> Result<()>,
{
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_path(path)
        .map_err(|e| IngestionError::Archive(format!("cannot open {}: {}", name, e)))?;

    for (index, row) in reader.deserialize::<T>().enumerate() {
        let row = row.map_err(|e| {
            IngestionError::Validation(format!("{} row {}: {}", name, index + 2, e))
        })?;
        visit(row)?;
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(raw: &str, field: &str, context: &str) -> Result<T> {
    raw.trim().parse::<T>().map_err(|_| {
        IngestionError::Validation(format!("{} has non-numeric {} {:?}", context, field, raw))
    })
}

fn find_operator_id(dir: &Path, operator_name: &str) -> Result<Option<String>> {
    let mut found = None;
    for_each_row(&dir.join(AGENCY_FILE), |row: AgencyRow| {
        if found.is_none() && row.agency_name.contains(operator_name) {
            found = Some(row.agency_id);
        }
        Ok(())
    })?;
    Ok(found)
}

/// Boardable stops (0) and stations (1); a blank location_type means 0.
/// Also returns the stop -> parent station links among them.
fn select_stations(dir: &Path) -> Result<(BTreeMap<String, Station>, HashMap<String, String>)> {
    let mut stations = BTreeMap::new();
    let mut parents = HashMap::new();

    for_each_row(&dir.join(STOPS_FILE), |row: StopRow| {
        let location_type = match row.location_type.trim() {
            "" => "0",
            other => other,
        };
        if location_type != "0" && location_type != "1" {
            return Ok(());
        }

        let context = format!("stop {}", row.stop_id);
        let latitude = parse_number::<f64>(&row.stop_lat, "stop_lat", &context)?;
        let longitude = parse_number::<f64>(&row.stop_lon, "stop_lon", &context)?;
        if !is_valid_coordinate(latitude, longitude) {
            return Err(IngestionError::Validation(format!(
                "{} is out of range ({}, {})",
                context, latitude, longitude
            )));
        }

        if !row.parent_station.trim().is_empty() {
            parents.insert(row.stop_id.clone(), row.parent_station.trim().to_string());
        }
        stations.insert(
            row.stop_id.clone(),
            Station {
                id: row.stop_id,
                name: row.stop_name,
                latitude,
                longitude,
                routes: Vec::new(),
            },
        );
        Ok(())
    })?;

    Ok((stations, parents))
}

/// Marks every station as served by every in-scope route.
///
/// This approximates the real linkage; `StationAssociation::StopTimes` does the join.
fn associate_all_routes(
    stations: &mut BTreeMap<String, Station>,
    routes: &BTreeMap<String, SelectedRoute>,
) {
    let route_ids: Vec<String> = routes.keys().cloned().collect();
    for station in stations.values_mut() {
        station.routes = route_ids.clone();
    }
}

/// Links stations to the routes whose trips stop there, propagating platform
/// memberships up to their parent station.
fn associate_by_stop_times(
    dir: &Path,
    stations: &mut BTreeMap<String, Station>,
    parents: &HashMap<String, String>,
    trips: &[TripRow],
) -> Result<()> {
    let trip_routes: HashMap<&str, &str> = trips
        .iter()
        .map(|t| (t.trip_id.as_str(), t.route_id.as_str()))
        .collect();

    let mut served: HashMap<String, BTreeSet<String>> = HashMap::new();
    for_each_row(&dir.join(STOP_TIMES_FILE), |row: StopTimeRow| {
        if let Some(route_id) = trip_routes.get(row.trip_id.as_str()) {
            if let Some(parent) = parents.get(&row.stop_id) {
                served
                    .entry(parent.clone())
                    .or_default()
                    .insert(route_id.to_string());
            }
            served.entry(row.stop_id).or_default().insert(route_id.to_string());
        }
        Ok(())
    })?;

    for (stop_id, station) in stations.iter_mut() {
        station.routes = served
            .remove(stop_id)
            .map(|routes| routes.into_iter().collect())
            .unwrap_or_default();
    }
    Ok(())
}
