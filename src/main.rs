mod calc;
mod config;
mod db;
mod errors;
mod import;
mod server;
mod state;

use crate::state::{AppState, DbCommand};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    // Structured logging (line-buffered for container log capture)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("coredrift journal starting");

    // Load config
    let cfg = match config::AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("config error: {e}");
            std::process::exit(1);
        }
    };

    // Init database (applies schema, seeds the symbol catalog)
    let db_pool = match db::init_db(&cfg.data_dir) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!("database init error: {e}");
            std::process::exit(1);
        }
    };

    // Bounded command channel into the single writer task
    let (db_tx, db_rx) = mpsc::channel::<DbCommand>(1024);

    // Create shared state
    let app_state = AppState::new(cfg.clone(), db_pool.clone(), db_tx.clone());

    // DB writer task (dedicated, owns all database writes)
    let db_pool_writer = db_pool.clone();
    tokio::spawn(async move {
        db::run_db_writer(db_pool_writer, db_rx).await;
    });

    // Axum HTTP + WS server
    let server_state = app_state.clone();
    let port = cfg.server_port;

    let app = axum::Router::new()
        .route(
            "/api/accounts",
            axum::routing::get(server::routes::list_accounts)
                .post(server::routes::create_account),
        )
        .route(
            "/api/accounts/{id}",
            axum::routing::put(server::routes::update_account)
                .delete(server::routes::delete_account),
        )
        .route(
            "/api/accounts/{id}/trades",
            axum::routing::get(server::routes::list_trades)
                .post(server::routes::create_trade),
        )
        .route(
            "/api/accounts/{id}/trades/{tid}",
            axum::routing::put(server::routes::update_trade)
                .delete(server::routes::delete_trade),
        )
        .route(
            "/api/accounts/{id}/trades/{tid}/restore",
            axum::routing::post(server::routes::restore_trade),
        )
        .route(
            "/api/accounts/{id}/bin",
            axum::routing::get(server::routes::list_bin),
        )
        .route(
            "/api/accounts/{id}/bin/{tid}",
            axum::routing::delete(server::routes::purge_trade),
        )
        .route(
            "/api/accounts/{id}/purge-expired",
            axum::routing::post(server::routes::purge_expired),
        )
        .route(
            "/api/accounts/{id}/merge",
            axum::routing::post(server::routes::merge_trades),
        )
        .route(
            "/api/accounts/{id}/import",
            axum::routing::post(server::routes::import_trades),
        )
        .route(
            "/api/accounts/{id}/stats",
            axum::routing::get(server::routes::get_stats),
        )
        .route("/api/symbols", axum::routing::get(server::routes::list_symbols))
        .route(
            "/api/setups",
            axum::routing::get(server::routes::list_setups).post(server::routes::create_setup),
        )
        .route(
            "/api/setups/{id}",
            axum::routing::delete(server::routes::delete_setup),
        )
        .route(
            "/api/tags",
            axum::routing::get(server::routes::list_tags).post(server::routes::create_tag),
        )
        .route("/api/tags/attach", axum::routing::post(server::routes::attach_tag))
        .route("/api/tags/{id}", axum::routing::delete(server::routes::delete_tag))
        .route(
            "/api/notes",
            axum::routing::get(server::routes::list_notes).post(server::routes::create_note),
        )
        .route("/api/notes/{id}", axum::routing::delete(server::routes::delete_note))
        .route("/api/counters", axum::routing::get(server::routes::get_counters))
        .route("/ws", axum::routing::get(server::ws::ws_handler))
        .fallback_service(
            tower_http::services::ServeDir::new("ui/dist")
                .fallback(tower_http::services::ServeFile::new("ui/dist/index.html")),
        )
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .with_state(server_state);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!("server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("bind error: {e}");
            std::process::exit(1);
        });

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("server error: {e}");
    }
}
