mod store;

use axum::{
    extract::{Form, Path, Query, State},
    http::StatusCode,
    response::Html,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
};
use store::{SeedData, StatusStore, StoreError};
use tms_core::{
    clock::{Clock, SystemClock},
    sync_contracts::{
        parse_last_update, BulkUpdateResponse, CycleStatusResponse, SyncDomain, SyncResponse,
    },
    view::{escape_html, render_table_body},
    RouteStatus,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use uuid::Uuid;

const DEFAULT_HUB_ADDR: &str = "127.0.0.1:5080";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    debug: bool,
    log_dir: String,
    csrf_token: String,
    seed_file: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[command(name = "tms-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value = "")]
    csrf_token: String,
    #[arg(long, default_value = "")]
    seed_file: String,
}

struct HubState {
    config: Config,
    store: RwLock<StatusStore>,
}

impl HubState {
    fn new(config: Config, store: StatusStore) -> Self {
        Self {
            config,
            store: RwLock::new(store),
        }
    }

    fn csrf_ok(&self, token: Option<&str>) -> bool {
        token.map(str::trim) == Some(self.config.csrf_token.as_str())
    }
}

#[derive(Debug, Default, Deserialize)]
struct SyncQuery {
    #[serde(default)]
    last_update: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CsrfForm {
    #[serde(default)]
    csrf_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CreateRouteForm {
    #[serde(default)]
    csrf_token: Option<String>,
    #[serde(default)]
    route_number: String,
    #[serde(default)]
    school: String,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let seed = match &config.seed_file {
        Some(path) => match SeedData::load(path) {
            Ok(seed) => seed,
            Err(err) => {
                error!(event = "seed_error", error = %err);
                return;
            }
        },
        None => SeedData::demo(),
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = StatusStore::with_seed(clock, seed);
    info!(
        event = "store_loaded",
        routes = store.route_count(),
        students = store.student_count()
    );

    let hub = Arc::new(HubState::new(config.clone(), store));
    let app = router(hub);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(event = "hub_start", addr = %config.addr);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "hub_error", error = %err);
    }
}

fn router(hub: Arc<HubState>) -> Router {
    Router::new()
        .route("/api/sync/:domain", get(sync_handler))
        .route("/routes", get(routes_page).post(create_route_handler))
        .route("/routes/bulk-update-status", post(bulk_update_handler))
        .route("/routes/:route_id", delete(delete_route_handler))
        .route("/routes/:route_id/cycle-status", post(cycle_status_handler))
        .route("/students", get(students_page))
        .route("/students/bulk", post(add_students_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(hub)
}

async fn sync_handler(
    State(hub): State<Arc<HubState>>,
    Path(domain): Path<String>,
    Query(query): Query<SyncQuery>,
) -> Json<SyncResponse> {
    let since = query
        .last_update
        .as_deref()
        .map(parse_last_update)
        .unwrap_or(0);
    let mut store = hub.store.write().await;
    let response = match domain.parse::<SyncDomain>() {
        Ok(SyncDomain::Routes) => store.sync_routes(since),
        Ok(SyncDomain::Students) => store.sync_students(since),
        Err(_) => store.sync_other(),
    };
    debug!(event = "sync", domain = %domain, since, timestamp = ?response.timestamp);
    Json(response)
}

async fn cycle_status_handler(
    State(hub): State<Arc<HubState>>,
    Path(route_id): Path<String>,
    Form(form): Form<CsrfForm>,
) -> (StatusCode, Json<CycleStatusResponse>) {
    if !hub.csrf_ok(form.csrf_token.as_deref()) {
        warn!(event = "csrf_rejected", path = "cycle-status", route_id = %route_id);
        return (
            StatusCode::FORBIDDEN,
            Json(CycleStatusResponse {
                success: false,
                status: None,
                message: Some("Invalid CSRF token".to_string()),
            }),
        );
    }
    let result = hub.store.write().await.cycle_status(&route_id);
    match result {
        Ok(status) => {
            info!(event = "status_cycled", route_id = %route_id, status = %status);
            (
                StatusCode::OK,
                Json(CycleStatusResponse {
                    success: true,
                    status: Some(status),
                    message: Some(format!("Route status changed to {}!", status.label())),
                }),
            )
        }
        Err(err) => {
            warn!(event = "cycle_failed", route_id = %route_id, error = %err);
            (
                StatusCode::NOT_FOUND,
                Json(CycleStatusResponse {
                    success: false,
                    status: None,
                    message: Some("Route not found!".to_string()),
                }),
            )
        }
    }
}

/// Form body with repeated `route_ids` (or `route_ids[]`) plus `status`.
async fn bulk_update_handler(
    State(hub): State<Arc<HubState>>,
    Form(fields): Form<Vec<(String, String)>>,
) -> (StatusCode, Json<BulkUpdateResponse>) {
    let mut token = None;
    let mut status_raw = None;
    let mut route_ids = Vec::new();
    for (key, value) in fields {
        match key.as_str() {
            "csrf_token" => token = Some(value),
            "status" => status_raw = Some(value),
            "route_ids" | "route_ids[]" if !value.trim().is_empty() => route_ids.push(value),
            _ => {}
        }
    }
    if !hub.csrf_ok(token.as_deref()) {
        warn!(event = "csrf_rejected", path = "bulk-update-status");
        return bulk_error(StatusCode::FORBIDDEN, "Invalid CSRF token");
    }
    let Some(status_raw) = status_raw.filter(|value| !value.trim().is_empty()) else {
        return bulk_error(
            StatusCode::BAD_REQUEST,
            "No routes selected or status not specified",
        );
    };
    if route_ids.is_empty() {
        return bulk_error(
            StatusCode::BAD_REQUEST,
            "No routes selected or status not specified",
        );
    }
    let Ok(status) = status_raw.parse::<RouteStatus>() else {
        return bulk_error(StatusCode::BAD_REQUEST, "Invalid status specified");
    };

    let updated = hub.store.write().await.bulk_update(&route_ids, status);
    info!(event = "bulk_update", requested = route_ids.len(), updated, status = %status);
    (
        StatusCode::OK,
        Json(BulkUpdateResponse {
            success: true,
            updated_count: Some(updated),
            status: Some(status),
            status_text: Some(status.label().to_string()),
            status_color: Some(status.color().to_string()),
            error: None,
        }),
    )
}

fn bulk_error(code: StatusCode, message: &str) -> (StatusCode, Json<BulkUpdateResponse>) {
    (
        code,
        Json(BulkUpdateResponse {
            success: false,
            error: Some(message.to_string()),
            ..BulkUpdateResponse::default()
        }),
    )
}

async fn create_route_handler(
    State(hub): State<Arc<HubState>>,
    Form(form): Form<CreateRouteForm>,
) -> (StatusCode, Json<Value>) {
    if !hub.csrf_ok(form.csrf_token.as_deref()) {
        return csrf_rejected("create-route");
    }
    let result = hub
        .store
        .write()
        .await
        .create_route(&form.route_number, &form.school);
    match result {
        Ok(route) => {
            info!(event = "route_created", route_id = %route.id, route_number = %route.route_number);
            (
                StatusCode::CREATED,
                Json(json!({ "success": true, "route_id": route.id })),
            )
        }
        Err(err) => store_error(err),
    }
}

async fn delete_route_handler(
    State(hub): State<Arc<HubState>>,
    Path(route_id): Path<String>,
    Form(form): Form<CsrfForm>,
) -> (StatusCode, Json<Value>) {
    if !hub.csrf_ok(form.csrf_token.as_deref()) {
        return csrf_rejected("delete-route");
    }
    let result = hub.store.write().await.delete_route(&route_id);
    match result {
        Ok(route) => {
            info!(event = "route_deleted", route_id = %route.id);
            (StatusCode::OK, Json(json!({ "success": true })))
        }
        Err(err) => store_error(err),
    }
}

/// Form body with repeated `name` fields and an optional `route_id`.
async fn add_students_handler(
    State(hub): State<Arc<HubState>>,
    Form(fields): Form<Vec<(String, String)>>,
) -> (StatusCode, Json<Value>) {
    let mut token = None;
    let mut route_id = None;
    let mut names = Vec::new();
    for (key, value) in fields {
        match key.as_str() {
            "csrf_token" => token = Some(value),
            "route_id" if !value.trim().is_empty() => route_id = Some(value),
            "name" | "names" | "name[]" => names.push(value),
            _ => {}
        }
    }
    if !hub.csrf_ok(token.as_deref()) {
        return csrf_rejected("students-bulk");
    }
    let result = hub
        .store
        .write()
        .await
        .add_students(&names, route_id.as_deref());
    match result {
        Ok(added) => {
            info!(event = "students_added", added);
            (
                StatusCode::OK,
                Json(json!({ "success": true, "added_count": added })),
            )
        }
        Err(err) => store_error(err),
    }
}

fn csrf_rejected(path: &str) -> (StatusCode, Json<Value>) {
    warn!(event = "csrf_rejected", path);
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "success": false, "message": "Invalid CSRF token" })),
    )
}

fn store_error(err: StoreError) -> (StatusCode, Json<Value>) {
    let (code, message) = match &err {
        StoreError::RouteNotFound(_) => (StatusCode::NOT_FOUND, "Route not found!".to_string()),
        StoreError::DuplicateRoute(_) => (StatusCode::CONFLICT, err.to_string()),
        StoreError::Invalid(_) | StoreError::Seed(_) => (StatusCode::BAD_REQUEST, err.to_string()),
    };
    warn!(event = "store_error", error = %err);
    (code, Json(json!({ "success": false, "message": message })))
}

async fn routes_page(State(hub): State<Arc<HubState>>) -> Html<String> {
    let mut store = hub.store.write().await;
    let stamp = store.read_stamp();
    let rows = store.route_rows();
    Html(render_page(
        &hub.config.csrf_token,
        stamp,
        "Routes",
        &["Route", "School", "Guide", "Status"],
        &render_table_body(SyncDomain::Routes.table_body_id(), &rows),
    ))
}

async fn students_page(State(hub): State<Arc<HubState>>) -> Html<String> {
    let mut store = hub.store.write().await;
    let stamp = store.read_stamp();
    let rows = store.student_rows();
    Html(render_page(
        &hub.config.csrf_token,
        stamp,
        "Students",
        &["Name", "Route"],
        &render_table_body(SyncDomain::Students.table_body_id(), &rows),
    ))
}

/// `sync-stamp` is the store stamp the rows were read at. A board seeds its
/// cursor with it so membership changes made before its first poll still
/// count as changes.
fn render_page(
    csrf_token: &str,
    sync_stamp: i64,
    title: &str,
    headings: &[&str],
    table_body: &str,
) -> String {
    let head: String = headings
        .iter()
        .map(|heading| format!("<th>{}</th>", escape_html(heading)))
        .collect();
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta name=\"csrf-token\" content=\"{token}\">\n\
         <meta name=\"sync-stamp\" content=\"{sync_stamp}\">\n\
         <title>{title} - Hamilton TMS</title>\n</head>\n<body>\n<h1>{title}</h1>\n\
         <table class=\"table\">\n<thead><tr>{head}</tr></thead>\n{table_body}\n</table>\n\
         <p class=\"text-muted\">Rendered {rendered}</p>\n</body>\n</html>\n",
        token = escape_html(csrf_token),
        title = escape_html(title),
        rendered = Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
    )
}

fn load_config() -> Config {
    let args = Args::parse();
    let addr = resolve_addr(&args.addr);
    let debug = args.debug || env_true("TMS_HUB_DEBUG");
    let log_dir = resolve_log_dir(&args.log_dir);
    let csrf_token = resolve_csrf_token(&args.csrf_token);
    let seed_file = resolve_seed_file(&args.seed_file);
    Config {
        addr,
        debug,
        log_dir,
        csrf_token,
        seed_file,
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("TMS_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Mirrors every log line to stdout and, when available, the hub log file.
struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("tms-hub.log"))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    env_non_empty("TMS_HUB_ADDR").unwrap_or_else(|| DEFAULT_HUB_ADDR.to_string())
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    env_non_empty("TMS_LOG_DIR").unwrap_or_else(|| ".tms/logs".to_string())
}

fn resolve_seed_file(seed_flag: &str) -> Option<PathBuf> {
    if !seed_flag.trim().is_empty() {
        return Some(PathBuf::from(seed_flag));
    }
    env_non_empty("TMS_SEED_FILE").map(PathBuf::from)
}

/// Explicit token when configured, otherwise one per process.
fn resolve_csrf_token(token_flag: &str) -> String {
    if !token_flag.trim().is_empty() {
        return token_flag.trim().to_string();
    }
    if let Some(token) = env_non_empty("TMS_CSRF_TOKEN") {
        return token.trim().to_string();
    }
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tms_core::clock::ManualClock;
    use tms_core::view::extract_table_body;

    const TOKEN: &str = "test-token";

    fn hub_at(start_ms: i64) -> (Arc<HubState>, ManualClock) {
        let clock = ManualClock::new(start_ms);
        let store = StatusStore::with_seed(Arc::new(clock.clone()), SeedData::demo());
        let config = Config {
            addr: DEFAULT_HUB_ADDR.to_string(),
            debug: false,
            log_dir: String::new(),
            csrf_token: TOKEN.to_string(),
            seed_file: None,
        };
        (Arc::new(HubState::new(config, store)), clock)
    }

    fn csrf() -> Form<CsrfForm> {
        Form(CsrfForm {
            csrf_token: Some(TOKEN.to_string()),
        })
    }

    fn fields(pairs: &[(&str, &str)]) -> Form<Vec<(String, String)>> {
        Form(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    async fn sync(hub: &Arc<HubState>, domain: &str, last_update: &str) -> SyncResponse {
        let Json(response) = sync_handler(
            State(hub.clone()),
            Path(domain.to_string()),
            Query(SyncQuery {
                last_update: Some(last_update.to_string()),
            }),
        )
        .await;
        response
    }

    #[tokio::test]
    async fn cycle_then_sync_reports_the_change() {
        let (hub, clock) = hub_at(1_000);
        let cursor = sync(&hub, "routes", "0").await.timestamp.expect("timestamp");
        clock.advance(100);

        let (code, Json(body)) =
            cycle_status_handler(State(hub.clone()), Path("r1".to_string()), csrf()).await;
        assert_eq!(code, StatusCode::OK);
        assert!(body.success);
        assert_eq!(body.status, Some(RouteStatus::Arrived));
        assert_eq!(body.message.as_deref(), Some("Route status changed to Arrived!"));

        let response = sync(&hub, "routes", &cursor.to_string()).await;
        let routes = response.routes.expect("routes");
        assert_eq!(routes["r1"].status, "arrived");
        assert_eq!(routes["r1"].status_text.as_deref(), Some("Arrived"));
        assert_eq!(routes["r2"].status, "not_present");
    }

    #[tokio::test]
    async fn unknown_route_is_404_with_message() {
        let (hub, _clock) = hub_at(0);
        let (code, Json(body)) =
            cycle_status_handler(State(hub), Path("nope".to_string()), csrf()).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert!(!body.success);
        assert_eq!(body.message.as_deref(), Some("Route not found!"));
    }

    #[tokio::test]
    async fn missing_csrf_token_is_forbidden() {
        let (hub, _clock) = hub_at(0);
        let (code, _) = cycle_status_handler(
            State(hub.clone()),
            Path("r1".to_string()),
            Form(CsrfForm::default()),
        )
        .await;
        assert_eq!(code, StatusCode::FORBIDDEN);
        assert_eq!(
            hub.store.read().await.route("r1").map(|route| route.status),
            Some(RouteStatus::NotPresent)
        );
    }

    #[tokio::test]
    async fn sync_sanitizes_non_finite_cursor() {
        let (hub, _clock) = hub_at(5_000);
        for raw in ["nan", "inf", "-inf", "garbage"] {
            let response = sync(&hub, "routes", raw).await;
            assert!(response.success);
            assert_eq!(response.routes.map(|routes| routes.len()), Some(3));
            assert_eq!(response.routes_updated, Some(false));
        }
    }

    #[tokio::test]
    async fn other_pages_get_basic_shape() {
        let (hub, _clock) = hub_at(5_000);
        let response = sync(&hub, "schools", "0").await;
        assert!(response.success);
        assert_eq!(response.timestamp, Some(5_000));
        assert_eq!(response.data, Some(json!({})));
        assert!(response.routes.is_none());
    }

    #[tokio::test]
    async fn bulk_update_validates_and_applies() {
        let (hub, _clock) = hub_at(0);
        let (code, Json(body)) = bulk_update_handler(
            State(hub.clone()),
            fields(&[("csrf_token", TOKEN), ("status", "ready")]),
        )
        .await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(
            body.error.as_deref(),
            Some("No routes selected or status not specified")
        );

        let (code, Json(body)) = bulk_update_handler(
            State(hub.clone()),
            fields(&[("csrf_token", TOKEN), ("route_ids", "r1"), ("status", "lost")]),
        )
        .await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body.error.as_deref(), Some("Invalid status specified"));

        let (code, Json(body)) = bulk_update_handler(
            State(hub.clone()),
            fields(&[
                ("csrf_token", TOKEN),
                ("route_ids", "r1"),
                ("route_ids[]", "r2"),
                ("route_ids", "ghost"),
                ("status", "ready"),
            ]),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body.updated_count, Some(2));
        assert_eq!(body.status_text.as_deref(), Some("Ready"));
        assert_eq!(body.status_color.as_deref(), Some("success"));
        let store = hub.store.read().await;
        assert!(store.route("r2").map(|route| route.guide_present).unwrap_or(false));
    }

    #[tokio::test]
    async fn create_and_delete_flag_membership_change() {
        let (hub, clock) = hub_at(1_000);
        let cursor = sync(&hub, "routes", "0").await.timestamp.expect("timestamp");
        clock.advance(50);
        let (code, Json(body)) = create_route_handler(
            State(hub.clone()),
            Form(CreateRouteForm {
                csrf_token: Some(TOKEN.to_string()),
                route_number: "400".to_string(),
                school: "Hamilton West".to_string(),
            }),
        )
        .await;
        assert_eq!(code, StatusCode::CREATED);
        let route_id = body["route_id"].as_str().expect("route id").to_string();
        assert_eq!(sync(&hub, "routes", &cursor.to_string()).await.routes_updated, Some(true));

        let (code, _) =
            delete_route_handler(State(hub.clone()), Path(route_id.clone()), csrf()).await;
        assert_eq!(code, StatusCode::OK);
        let (code, Json(body)) =
            delete_route_handler(State(hub), Path(route_id), csrf()).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "Route not found!");
    }

    #[tokio::test]
    async fn student_upload_sets_needs_refresh() {
        let (hub, clock) = hub_at(1_000);
        let cursor = sync(&hub, "students", "0").await.timestamp.expect("timestamp");
        clock.advance(10);
        let (code, Json(body)) = add_students_handler(
            State(hub.clone()),
            fields(&[("csrf_token", TOKEN), ("name", "Eli Novak"), ("name", "Fay Wu")]),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["added_count"], 2);
        let response = sync(&hub, "students", &cursor.to_string()).await;
        assert_eq!(response.needs_refresh, Some(true));
        assert_eq!(response.student_count, Some(5));
    }

    #[tokio::test]
    async fn pages_embed_token_and_table_body() {
        let (hub, _clock) = hub_at(0);
        let Html(page) = routes_page(State(hub.clone())).await;
        assert!(page.contains(&format!("<meta name=\"csrf-token\" content=\"{TOKEN}\">")));
        let body = extract_table_body(&page, "routes-table-body").expect("routes body");
        assert_eq!(body.rows.len(), 3);
        assert!(body.rows.iter().all(|row| row.status() == Some(RouteStatus::NotPresent)));

        let Html(page) = students_page(State(hub)).await;
        let body = extract_table_body(&page, "students-table-body").expect("students body");
        assert_eq!(body.rows.len(), 3);
        assert!(body.rows.iter().all(|row| row.status().is_none()));
    }

    fn page_stamp(page: &str) -> i64 {
        let needle = "name=\"sync-stamp\" content=\"";
        let start = page.find(needle).expect("stamp meta") + needle.len();
        let end = page[start..].find('"').expect("stamp end") + start;
        page[start..end].parse().expect("numeric stamp")
    }

    #[tokio::test]
    async fn route_added_after_page_render_is_reported_on_first_sync() {
        let (hub, clock) = hub_at(50_000);
        let Html(page) = routes_page(State(hub.clone())).await;
        let stamp = page_stamp(&page);
        assert_eq!(stamp, 50_000);

        let unchanged = sync(&hub, "routes", &stamp.to_string()).await;
        assert_eq!(unchanged.routes_updated, Some(false));

        hub.store
            .write()
            .await
            .create_route("310", "Hamilton East")
            .expect("create");
        clock.advance(10);
        let response = sync(&hub, "routes", &stamp.to_string()).await;
        assert_eq!(response.routes_updated, Some(true));
    }

    #[tokio::test]
    async fn student_added_at_render_millisecond_still_needs_refresh() {
        let (hub, _clock) = hub_at(80_000);
        let Html(page) = students_page(State(hub.clone())).await;
        let stamp = page_stamp(&page);
        hub.store
            .write()
            .await
            .add_students(&["Dana Reyes".to_string()], None)
            .expect("add");
        let response = sync(&hub, "students", &stamp.to_string()).await;
        assert_eq!(response.needs_refresh, Some(true));
    }

    #[test]
    fn generated_csrf_tokens_are_random_hex() {
        std::env::remove_var("TMS_CSRF_TOKEN");
        let first = resolve_csrf_token("");
        let second = resolve_csrf_token("");
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, second);
    }

    #[test]
    fn explicit_csrf_token_wins() {
        assert_eq!(resolve_csrf_token(" abc "), "abc");
        assert_eq!(resolve_addr("0.0.0.0:9000"), "0.0.0.0:9000");
        assert_eq!(resolve_log_dir("/tmp/tms"), "/tmp/tms");
    }
}
