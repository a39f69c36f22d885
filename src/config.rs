// Runtime configuration, resolved once at startup and passed into each component.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_GTFS_URL: &str = "http://gtfs.openov.nl/gtfs-rt/gtfs-openov-nl.zip";
const DEFAULT_OPERATOR: &str = "GVB";
const DEFAULT_LINES: [&str; 5] = ["50", "51", "52", "53", "54"];
/// GTFS route_type for subway/metro.
const METRO_ROUTE_TYPE: u16 = 1;

/// A WGS84 coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Amsterdam Centraal area; the anchor for placeholder line geometry.
pub const AMSTERDAM_CENTER: GeoPoint = GeoPoint {
    latitude: 52.3676,
    longitude: 4.9041,
};

/// How stations are linked to the routes that serve them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationAssociation {
    /// Every station is marked as served by every in-scope route.
    AllRoutes,
    /// Join stop_times.txt with trips.txt.
    StopTimes,
}

impl FromStr for StationAssociation {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all-routes" | "all_routes" | "all" => Ok(StationAssociation::AllRoutes),
            "stop-times" | "stop_times" => Ok(StationAssociation::StopTimes),
            _ => Err(()),
        }
    }
}

/// Upstream contract of the live vehicle endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveApiVariant {
    /// One call returning a map keyed by vehicle id.
    VehicleMap,
    /// A journey list followed by one detail call per journey. Older API generation.
    Journeys,
}

impl FromStr for LiveApiVariant {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vehicle-map" | "vehicle_map" | "vehicles" => Ok(LiveApiVariant::VehicleMap),
            "journeys" => Ok(LiveApiVariant::Journeys),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub archive_url: String,
    /// Substring matched against agency_name.
    pub operator_name: String,
    pub route_type: u16,
    /// Route short names considered in scope.
    pub route_whitelist: Vec<String>,
    pub station_association: StationAssociation,
    /// Parent directory for per-run scratch directories.
    pub scratch_root: PathBuf,
    pub timeout: Duration,
    pub reference_point: GeoPoint,
}

#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub url: Option<String>,
    pub variant: LiveApiVariant,
    pub route_whitelist: Vec<String>,
    pub timeout: Duration,
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// `redis://...` or `memory://`.
    pub url: String,
    pub network_ttl: Duration,
    /// Bounds connecting and every command read or write.
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub feed: FeedConfig,
    pub live: LiveConfig,
    pub cache: CacheConfig,
    pub server: ServerConfig,
    /// Served by the token endpoint when nothing has been stored in the cache.
    pub default_map_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let whitelist: Vec<String> = DEFAULT_LINES.iter().map(|s| s.to_string()).collect();

        Config {
            feed: FeedConfig {
                archive_url: DEFAULT_GTFS_URL.to_string(),
                operator_name: DEFAULT_OPERATOR.to_string(),
                route_type: METRO_ROUTE_TYPE,
                route_whitelist: whitelist.clone(),
                station_association: StationAssociation::AllRoutes,
                scratch_root: default_scratch_root(),
                timeout: Duration::from_secs(120),
                reference_point: AMSTERDAM_CENTER,
            },
            live: LiveConfig {
                url: None,
                variant: LiveApiVariant::VehicleMap,
                route_whitelist: whitelist,
                timeout: Duration::from_secs(5),
                ttl: Duration::from_secs(3),
            },
            cache: CacheConfig {
                url: "redis://localhost:6379".to_string(),
                network_ttl: Duration::from_secs(86400),
                timeout: Duration::from_secs(2),
            },
            server: ServerConfig {
                bind_addr: "0.0.0.0".to_string(),
                port: 8000,
            },
            default_map_token: None,
        }
    }
}

impl Config {
    /// Reads the process environment (after loading `.env`, if any) on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from an arbitrary variable lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Config::default();

        if let Some(url) = var("GTFS_URL") {
            config.feed.archive_url = url;
        }
        if let Some(operator) = var("METRO_OPERATOR") {
            config.feed.operator_name = operator;
        }
        if let Some(raw) = var("METRO_ROUTE_TYPE") {
            config.feed.route_type = parse_var("METRO_ROUTE_TYPE", &raw)?;
        }
        if let Some(raw) = var("METRO_LINES") {
            let lines: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if lines.is_empty() {
                return Err(ConfigError::Invalid { var: "METRO_LINES", value: raw });
            }
            config.feed.route_whitelist = lines.clone();
            config.live.route_whitelist = lines;
        }
        if let Some(raw) = var("STATION_ASSOCIATION") {
            config.feed.station_association = parse_var("STATION_ASSOCIATION", &raw)?;
        }
        if let Some(dir) = var("SCRATCH_DIR") {
            config.feed.scratch_root = PathBuf::from(dir);
        }
        if let Some(raw) = var("FEED_TIMEOUT_SECS") {
            config.feed.timeout = Duration::from_secs(parse_var("FEED_TIMEOUT_SECS", &raw)?);
        }

        config.live.url = var("LIVE_VEHICLES_URL");
        if let Some(raw) = var("LIVE_API_VARIANT") {
            config.live.variant = parse_var("LIVE_API_VARIANT", &raw)?;
        }
        if let Some(raw) = var("LIVE_TIMEOUT_SECS") {
            config.live.timeout = Duration::from_secs(parse_var("LIVE_TIMEOUT_SECS", &raw)?);
        }
        if let Some(raw) = var("POSITIONS_TTL_SECS") {
            config.live.ttl = Duration::from_secs(parse_var("POSITIONS_TTL_SECS", &raw)?);
        }

        if let Some(url) = var("REDIS_URL") {
            config.cache.url = url;
        }
        if let Some(raw) = var("NETWORK_TTL_SECS") {
            config.cache.network_ttl = Duration::from_secs(parse_var("NETWORK_TTL_SECS", &raw)?);
        }

        if let Some(addr) = var("BIND_ADDR") {
            config.server.bind_addr = addr;
        }
        if let Some(raw) = var("PORT") {
            config.server.port = parse_var("PORT", &raw)?;
        }

        config.default_map_token = var("MAPBOX_ACCESS_TOKEN");

        Ok(config)
    }
}

fn parse_var<T: FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
        var,
        value: raw.to_string(),
    })
}

fn default_scratch_root() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("metro_tracker"))
        .unwrap_or_else(std::env::temp_dir)
}
