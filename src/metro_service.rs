// The contract the HTTP layer calls into: network topology, live positions and the
// map token.

use std::sync::Arc;

use crate::cache_store::CacheStore;
use crate::config::Config;
use crate::error::{FetchError, TokenError};
use crate::feed_ingest::FeedIngestor;
use crate::live_positions::LivePositionFetcher;
use crate::map_token::MapTokenStore;
use crate::metro_models::{RouteMap, StationMap, VehiclePosition};
use crate::network_resolver::NetworkResolver;
use crate::upstream::{HttpUpstream, Upstream};

pub struct MetroService {
    cache: Arc<CacheStore>,
    resolver: NetworkResolver,
    live: LivePositionFetcher,
    tokens: MapTokenStore,
}

impl MetroService {
    /// Wires every component from `config`, connecting to the configured cache and
    /// using real HTTP for upstream calls.
    pub fn from_config(config: &Config) -> Result<Self, FetchError> {
        let cache = Arc::new(CacheStore::connect(&config.cache));
        let upstream: Arc<dyn Upstream> = Arc::new(HttpUpstream::new()?);
        Ok(Self::with_parts(config, cache, upstream))
    }

    pub fn with_parts(
        config: &Config,
        cache: Arc<CacheStore>,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        let ingestor = FeedIngestor::new(config.feed.clone(), Arc::clone(&upstream));
        let resolver = NetworkResolver::new(
            Arc::clone(&cache),
            ingestor,
            config.cache.network_ttl,
            config.feed.reference_point,
        );
        let live = LivePositionFetcher::new(Arc::clone(&cache), upstream, config.live.clone());
        let tokens = MapTokenStore::new(Arc::clone(&cache), config.default_map_token.clone());

        MetroService {
            cache,
            resolver,
            live,
            tokens,
        }
    }

    pub fn get_routes(&self, force_refresh: bool) -> RouteMap {
        self.resolver.get_routes(force_refresh)
    }

    pub fn get_stations(&self, force_refresh: bool) -> StationMap {
        self.resolver.get_stations(force_refresh)
    }

    pub fn get_positions(&self) -> Vec<VehiclePosition> {
        self.live.get_positions()
    }

    pub fn set_map_token(&self, token: &str) -> Result<(), TokenError> {
        self.tokens.set(token)
    }

    pub fn get_map_token(&self) -> Result<String, TokenError> {
        self.tokens.get()
    }

    pub fn clear_map_token(&self) -> bool {
        self.tokens.clear()
    }

    pub fn cache_degraded(&self) -> bool {
        self.cache.is_degraded()
    }
}
