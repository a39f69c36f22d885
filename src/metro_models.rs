// Domain model for the metro map: lines, stations and live train positions.
//
// Static topology (Route/Station) is produced as a whole snapshot per ingestion run.
// Positions are produced per poll and replaced wholesale by the next one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Data Structures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Ids of the routes serving this station, all present in the same snapshot.
    pub routes: Vec<String>,
}

/// A metro line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub name: String,
    /// Hex RGB without the leading `#`.
    pub color: String,
    pub route_id: String,
    /// `[longitude, latitude]` points in rendering order. May be empty.
    pub shape: Vec<[f64; 2]>,
    pub stations: Vec<Station>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehiclePosition {
    pub id: String,
    pub route_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub bearing: Option<f64>,
    pub speed: Option<f64>,
    pub status: Option<String>,
    /// Unix seconds. Fetch time when the upstream omits a vehicle timestamp.
    pub timestamp: i64,
    pub vehicle_id: String,
    pub trip_id: Option<String>,
}

pub type RouteMap = BTreeMap<String, Route>;
pub type StationMap = BTreeMap<String, Station>;

/// One consistent ingestion result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkSnapshot {
    pub routes: RouteMap,
    pub stations: StationMap,
}

pub fn is_valid_coordinate(latitude: f64, longitude: f64) -> bool {
    (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude)
}

pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}
