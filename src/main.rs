// Amsterdam metro tracker API server
// Serves metro lines, stations and live train positions resolved from the GVB feed

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpResponse, HttpServer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod cache_store;
mod config;
mod error;
mod feed_ingest;
mod geometry;
mod live_positions;
mod map_token;
mod metro_models;
mod metro_service;
mod network_resolver;
mod single_flight;
mod upstream;

use config::Config;
use error::TokenError;
use metro_models::current_timestamp;
use metro_service::MetroService;

#[derive(Clone)]
struct AppState {
    service: Arc<MetroService>,
    sources: Vec<String>,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    timestamp: i64,
    sources: Vec<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T, sources: &[String]) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            timestamp: current_timestamp(),
            sources: sources.to_vec(),
        }
    }

    fn error(message: String) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            timestamp: current_timestamp(),
            sources: vec![],
        }
    }
}

#[derive(Deserialize)]
struct RefreshQuery {
    force_refresh: Option<String>,
}

impl RefreshQuery {
    /// Accepts the usual query-string spellings of a boolean; blank means false.
    fn force_refresh(&self) -> Result<bool, String> {
        let Some(raw) = self.force_refresh.as_deref() else {
            return Ok(false);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "0" | "false" | "f" | "no" | "n" | "off" => Ok(false),
            "1" | "true" | "t" | "yes" | "y" | "on" => Ok(true),
            _ => Err(format!("Invalid force_refresh value {:?}", raw)),
        }
    }
}

#[derive(Deserialize)]
struct TokenRequest {
    token: String,
}

// ============================================================================
// Metro Endpoints
// ============================================================================

fn unavailable(what: &str, e: tokio::task::JoinError) -> HttpResponse {
    error!(error = %e, "{} task failed", what);
    let message = format!("Failed to resolve {}", what);
    HttpResponse::ServiceUnavailable().json(ApiResponse::<()>::error(message))
}

fn bad_request(message: String) -> HttpResponse {
    HttpResponse::BadRequest().json(ApiResponse::<()>::error(message))
}

async fn get_metro_lines(
    state: web::Data<AppState>,
    query: web::Query<RefreshQuery>,
) -> HttpResponse {
    let force_refresh = match query.force_refresh() {
        Ok(flag) => flag,
        Err(message) => return bad_request(message),
    };
    let service = state.service.clone();

    match tokio::task::spawn_blocking(move || service.get_routes(force_refresh)).await {
        Ok(routes) => {
            info!(count = routes.len(), force_refresh, "Metro lines requested");
            let lines: Vec<_> = routes.into_values().collect();
            HttpResponse::Ok().json(ApiResponse::success(lines, &state.sources))
        }
        Err(e) => unavailable("metro lines", e),
    }
}

async fn get_stations(
    state: web::Data<AppState>,
    query: web::Query<RefreshQuery>,
) -> HttpResponse {
    let force_refresh = match query.force_refresh() {
        Ok(flag) => flag,
        Err(message) => return bad_request(message),
    };
    let service = state.service.clone();

    match tokio::task::spawn_blocking(move || service.get_stations(force_refresh)).await {
        Ok(stations) => {
            info!(count = stations.len(), force_refresh, "Stations requested");
            let stations: Vec<_> = stations.into_values().collect();
            HttpResponse::Ok().json(ApiResponse::success(stations, &state.sources))
        }
        Err(e) => unavailable("stations", e),
    }
}

async fn get_train_positions(state: web::Data<AppState>) -> HttpResponse {
    let service = state.service.clone();

    match tokio::task::spawn_blocking(move || service.get_positions()).await {
        Ok(positions) => {
            info!(count = positions.len(), "Train positions requested");
            HttpResponse::Ok().json(ApiResponse::success(positions, &state.sources))
        }
        Err(e) => unavailable("train positions", e),
    }
}

// ============================================================================
// Config Endpoints
// ============================================================================

fn token_error_response(e: TokenError) -> HttpResponse {
    let body = ApiResponse::<()>::error(e.to_string());
    match e {
        TokenError::Malformed => HttpResponse::BadRequest().json(body),
        TokenError::NotFound => HttpResponse::NotFound().json(body),
        TokenError::Unavailable => HttpResponse::ServiceUnavailable().json(body),
    }
}

async fn set_map_token(
    state: web::Data<AppState>,
    request: web::Json<TokenRequest>,
) -> HttpResponse {
    let service = state.service.clone();
    let token = request.into_inner().token;

    match tokio::task::spawn_blocking(move || service.set_map_token(&token)).await {
        Ok(Ok(())) => HttpResponse::Ok().json(ApiResponse::success(
            serde_json::json!({"message": "Token stored successfully"}),
            &state.sources,
        )),
        Ok(Err(e)) => {
            warn!(error = %e, "Map token rejected");
            token_error_response(e)
        }
        Err(e) => unavailable("map token", e),
    }
}

async fn get_map_token(state: web::Data<AppState>) -> HttpResponse {
    let service = state.service.clone();

    match tokio::task::spawn_blocking(move || service.get_map_token()).await {
        Ok(Ok(token)) => HttpResponse::Ok().json(ApiResponse::success(
            serde_json::json!({"token": token, "masked": map_token::mask(&token)}),
            &state.sources,
        )),
        Ok(Err(e)) => token_error_response(e),
        Err(e) => unavailable("map token", e),
    }
}

async fn delete_map_token(state: web::Data<AppState>) -> HttpResponse {
    let service = state.service.clone();

    match tokio::task::spawn_blocking(move || service.clear_map_token()).await {
        Ok(true) => HttpResponse::Ok().json(ApiResponse::success(
            serde_json::json!({"message": "Token deleted"}),
            &state.sources,
        )),
        Ok(false) => token_error_response(TokenError::NotFound),
        Err(e) => unavailable("map token", e),
    }
}

// ============================================================================
// Meta Endpoints
// ============================================================================

async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "service": "Amsterdam Metro Tracker API",
        "version": env!("CARGO_PKG_VERSION"),
        "cache": if state.service.cache_degraded() { "degraded" } else { "connected" },
        "timestamp": current_timestamp(),
    }))
}

async fn root() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "message": "Amsterdam Metro Tracker API",
        "endpoints": [
            "/api/metro-lines",
            "/api/stations",
            "/api/train-positions",
            "/api/config/mapbox-token"
        ]
    }))
}

// ============================================================================
// Background Task
// ============================================================================

/// Loads the network once at startup so the first client request is a cache hit.
async fn warm_network_cache(service: Arc<MetroService>) {
    match tokio::task::spawn_blocking(move || service.get_routes(false)).await {
        Ok(routes) => info!(routes = routes.len(), "Network cache warmed"),
        Err(e) => error!(error = %e, "Network warm-up task panicked"),
    }
}

// ============================================================================
// Server Setup
// ============================================================================

async fn run_server(state: AppState, bind_addr: String, port: u16) -> std::io::Result<()> {
    tokio::spawn(warm_network_cache(state.service.clone()));

    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║   🚇 Amsterdam Metro Tracker API                           ║");
    println!("╚════════════════════════════════════════════════════════════╝\n");
    println!("🌐 Server running on: http://{}:{}", bind_addr, port);
    println!("📍 Available Routes:");
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│   GET    /api/metro-lines?force_refresh=  - Metro lines     │");
    println!("│   GET    /api/stations?force_refresh=     - Stations        │");
    println!("│   GET    /api/train-positions             - Live trains     │");
    println!("│   GET    /api/config/mapbox-token         - Map token       │");
    println!("│   POST   /api/config/mapbox-token         - Store token     │");
    println!("│   DELETE /api/config/mapbox-token         - Forget token    │");
    println!("│   GET    /healthz                         - Health check    │");
    println!("└─────────────────────────────────────────────────────────────┘\n");

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .route("/", web::get().to(root))
            .route("/healthz", web::get().to(health_check))
            .service(
                web::scope("/api")
                    .route("/metro-lines", web::get().to(get_metro_lines))
                    .route("/stations", web::get().to(get_stations))
                    .route("/train-positions", web::get().to(get_train_positions))
                    .route("/config/mapbox-token", web::get().to(get_map_token))
                    .route("/config/mapbox-token", web::post().to(set_map_token))
                    .route("/config/mapbox-token", web::delete().to(delete_map_token)),
            )
    })
    .bind((bind_addr.as_str(), port))?
    .run()
    .await
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    info!(
        feed = %config.feed.archive_url,
        operator = %config.feed.operator_name,
        lines = ?config.feed.route_whitelist,
        live = ?config.live.url,
        "Starting metro tracker"
    );

    // Built outside the async runtime: the blocking HTTP client must not be created
    // or dropped on a runtime thread.
    let service = match MetroService::from_config(&config) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            eprintln!("❌ Failed to initialize upstream HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let state = AppState {
        service: Arc::clone(&service),
        sources: vec![config.feed.operator_name.clone()],
    };

    let result = actix_web::rt::System::new().block_on(run_server(
        state,
        config.server.bind_addr.clone(),
        config.server.port,
    ));
    drop(service);
    result
}
