// KMB ETA board server
// Polls the KMB open data API for the saved watch-list and serves the
// stop-grouped board as JSON.

use actix_cors::Cors;
use actix_web::{App, HttpResponse, HttpServer, middleware, web};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kmb_eta_web::{
    Config, FileStore, KmbClient, LiveBoard, RefreshOutcome, SystemClock, WatchEntry, WatchListStore,
    default_watch_list,
};

type Board = LiveBoard<KmbClient, FileStore, SystemClock>;

#[derive(Clone)]
struct AppState {
    board: Arc<Board>,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    timestamp: i64,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    fn error(message: String) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

// ============================================================================
// Board
// ============================================================================

async fn get_board(state: web::Data<AppState>) -> HttpResponse {
    match state.board.render() {
        Some(view) => HttpResponse::Ok().json(ApiResponse::success(view)),
        None => HttpResponse::ServiceUnavailable()
            .json(ApiResponse::<String>::error("Board has not been loaded yet".to_string())),
    }
}

async fn force_refresh(state: web::Data<AppState>) -> HttpResponse {
    info!("🔄 Manual refresh requested...");

    match state.board.refresh().await {
        Ok(RefreshOutcome::Published) => HttpResponse::Ok().json(ApiResponse::success("Board refreshed")),
        Ok(RefreshOutcome::Discarded) => HttpResponse::ServiceUnavailable()
            .json(ApiResponse::<String>::error("Server is shutting down".to_string())),
        Err(e) => {
            warn!("⚠️  Manual refresh failed: {}", e);
            HttpResponse::BadGateway().json(ApiResponse::<String>::error(format!("Refresh failed: {}", e)))
        }
    }
}

async fn refresh_after_change(board: &Board) {
    if let Err(e) = board.refresh().await {
        warn!("⚠️  Refresh after watch-list change failed: {}", e);
    }
}

// ============================================================================
// Watch-list
// ============================================================================

async fn get_routes(state: web::Data<AppState>) -> HttpResponse {
    let entries = state.board.store().load().await;
    HttpResponse::Ok().json(ApiResponse::success(entries))
}

async fn add_route(state: web::Data<AppState>, entry: web::Json<WatchEntry>) -> HttpResponse {
    let entry = entry.into_inner();
    if entry.stop_id.is_empty() || entry.route.is_empty() || entry.service_type.is_empty() {
        return HttpResponse::BadRequest()
            .json(ApiResponse::<String>::error("stop, route and service_type are required".to_string()));
    }

    if state.board.store().add_entry(entry.clone()).await {
        refresh_after_change(&state.board).await;
        HttpResponse::Ok().json(ApiResponse::success(entry))
    } else {
        HttpResponse::InternalServerError()
            .json(ApiResponse::<String>::error(format!("Failed to save {}", entry.key())))
    }
}

async fn remove_route(state: web::Data<AppState>, entry: web::Json<WatchEntry>) -> HttpResponse {
    match state.board.store().remove_entry(entry.key()).await {
        Ok(()) => {
            refresh_after_change(&state.board).await;
            HttpResponse::Ok().json(ApiResponse::success(state.board.store().load().await))
        }
        Err(e) => {
            error!("❌ Failed to remove {}: {}", entry.key(), e);
            HttpResponse::InternalServerError().json(ApiResponse::<String>::error(e.to_string()))
        }
    }
}

// ============================================================================
// Favorite stops
// ============================================================================

async fn get_favorites(state: web::Data<AppState>) -> HttpResponse {
    let ids = state.board.store().load_favorite_stop_ids().await;
    HttpResponse::Ok().json(ApiResponse::success(ids))
}

async fn add_favorite(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let stop_id = path.into_inner();

    if state.board.store().add_favorite_stop(&stop_id).await {
        HttpResponse::Ok().json(ApiResponse::success(stop_id))
    } else {
        HttpResponse::InternalServerError()
            .json(ApiResponse::<String>::error(format!("Failed to save favorite '{}'", stop_id)))
    }
}

async fn remove_favorite(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let stop_id = path.into_inner();

    match state.board.store().remove_favorite_stop(&stop_id).await {
        Ok(()) => HttpResponse::Ok().json(ApiResponse::success(stop_id)),
        Err(e) => {
            error!("❌ Failed to remove favorite {}: {}", stop_id, e);
            HttpResponse::InternalServerError().json(ApiResponse::<String>::error(e.to_string()))
        }
    }
}

async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let snapshot = state.board.snapshot();
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "KMB ETA Board",
        "version": env!("CARGO_PKG_VERSION"),
        "last_refresh": snapshot.as_ref().map(|s| s.refreshed_at.to_rfc3339()),
        "cached_stop_names": state.board.stop_names().len(),
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

// ============================================================================
// Server Setup
// ============================================================================

async fn run_server(config: Config, client: KmbClient) -> std::io::Result<()> {
    let store = Arc::new(WatchListStore::new(
        FileStore::new(&config.data_dir),
        default_watch_list(),
    ));
    let board = Arc::new(LiveBoard::new(client, store, SystemClock));
    let app_state = AppState { board: board.clone() };

    let poller = board.start_polling(config.poll_period);

    info!("🌐 Server running on: http://{}", config.bind_addr);
    info!("💾 Watch-list stored in: {:?}", config.data_dir);
    info!("🔄 Auto-refresh: every {} seconds", config.poll_period.as_secs());

    let result = HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .route("/health", web::get().to(health_check))
            .service(
                web::scope("/api/eta")
                    .route("/board", web::get().to(get_board))
                    .route("/refresh", web::post().to(force_refresh))
                    .route("/routes", web::get().to(get_routes))
                    .route("/routes", web::post().to(add_route))
                    .route("/routes", web::delete().to(remove_route))
                    .route("/favorites", web::get().to(get_favorites))
                    .route("/favorites/{stop_id}", web::post().to(add_favorite))
                    .route("/favorites/{stop_id}", web::delete().to(remove_favorite)),
            )
    })
    .bind(config.bind_addr.as_str())?
    .run()
    .await;

    board.shutdown();
    poller.shutdown().await;
    info!("👋 Board poller stopped");

    result
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    info!("🚀 KMB ETA Board v{}", env!("CARGO_PKG_VERSION"));
    info!("📡 Upstream API: {}", config.api_base_url);

    let client = match KmbClient::new(config.api_base_url.clone(), config.request_timeout) {
        Ok(client) => client,
        Err(e) => {
            error!("❌ Failed to initialize ETA client: {}", e);
            std::process::exit(1);
        }
    };

    actix_web::rt::System::new().block_on(run_server(config, client))
}
