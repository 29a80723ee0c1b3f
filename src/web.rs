use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, Request, Response, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::{
    trace::TraceLayer,
    validate_request::{ValidateRequest, ValidateRequestHeaderLayer},
};
use tracing::info;

use crate::db::{Database, ImportRunEntry, TableCounts};
use crate::error::AppError;
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::models::{Group, LessonView, WeekType};
use crate::pipeline::{Importer, TriggerOutcome};
use crate::query::{self, DatedLesson};

const DEFAULT_RUN_LIMIT: usize = 50;
const MAX_RUN_LIMIT: usize = 500;
const SEARCH_LIMIT: usize = 50;

/// Application state shared between handlers
pub struct AppState {
    pub db: Arc<Database>,
    pub importer: Arc<Importer>,
}

/// Create the Axum router with all routes
pub fn create_router(state: AppState, admin_token: Option<String>) -> Router {
    let state = Arc::new(state);

    let mut admin = Router::new().route("/timetable/update", post(trigger_update));
    if let Some(token) = admin_token {
        admin = admin.route_layer(ValidateRequestHeaderLayer::custom(AdminToken(token.into())));
    }

    Router::new()
        .route("/timetable/imports", get(import_runs))
        .route("/timetable/imports/status", get(import_status))
        .route("/timetable/imports/{id}", get(import_run))
        .route("/timetable/search_group", get(search_group))
        .route("/timetable/group/{id}/schedule", get(group_schedule))
        .route("/timetable/group/{id}/day/{weekday}", get(group_day))
        .route("/timetable/group/{id}/today", get(group_today))
        .route("/timetable/group/{id}/tomorrow", get(group_tomorrow))
        .route("/timetable/user/{user_id}/select-group", post(select_group))
        .route("/timetable/user/{user_id}/group", get(user_group))
        .route("/timetable/user/{user_id}/schedule", get(user_schedule))
        .route("/timetable/user/{user_id}/schedule/day/{weekday}", get(user_day))
        .route("/timetable/user/{user_id}/schedule/today", get(user_today))
        .route("/timetable/user/{user_id}/schedule/tomorrow", get(user_tomorrow))
        .merge(admin)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the web server on the given port; returns once `shutdown` fires
pub async fn start_server(
    router: Router,
    port: u16,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(port = port, addr = %addr, "Web server started");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    info!("Web server stopped");
    Ok(())
}

/// Bearer-token check for administrative routes.
#[derive(Clone)]
struct AdminToken(Arc<str>);

impl<B> ValidateRequest<B> for AdminToken {
    type ResponseBody = axum::body::Body;

    fn validate(&mut self, request: &mut Request<B>) -> Result<(), Response<Self::ResponseBody>> {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .is_some_and(|token| token.trim() == &*self.0);

        if authorized {
            Ok(())
        } else {
            Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({ "detail": "Missing or invalid admin token" })),
            )
                .into_response())
        }
    }
}

#[derive(Debug, Deserialize)]
struct UpdateRequest {
    #[serde(default)]
    force_update: bool,
}

async fn trigger_update(
    State(state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<UpdateRequest>,
) -> impl IntoResponse {
    let outcome = state.importer.trigger(request.force_update);
    let message = match outcome {
        TriggerOutcome::Started => "Обновление расписания запущено",
        TriggerOutcome::AlreadyRunning => "Обновление расписания уже выполняется",
    };

    (
        StatusCode::ACCEPTED,
        Json(json!({ "message": message, "status": outcome })),
    )
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
}

async fn import_runs(
    State(state): State<Arc<AppState>>,
    ApiQuery(params): ApiQuery<RunsQuery>,
) -> Result<Json<Vec<ImportRunEntry>>, AppError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_RUN_LIMIT)
        .clamp(1, MAX_RUN_LIMIT);
    Ok(Json(state.db.get_import_runs(limit).await?))
}

#[derive(Debug, Serialize)]
struct ImportStatusResponse {
    running: bool,
    db_type: &'static str,
    last_run: Option<ImportRunEntry>,
    counts: TableCounts,
}

async fn import_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ImportStatusResponse>, AppError> {
    let last_run = state.db.get_import_runs(1).await?.into_iter().next();
    Ok(Json(ImportStatusResponse {
        running: state.importer.is_running(),
        db_type: state.db.db_type(),
        last_run,
        counts: state.db.table_counts().await?,
    }))
}

async fn import_run(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
) -> Result<Json<ImportRunEntry>, AppError> {
    state
        .db
        .get_import_run(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Import run {} not found", id)))
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    query: String,
}

async fn search_group(
    State(state): State<Arc<AppState>>,
    ApiQuery(params): ApiQuery<SearchQuery>,
) -> Result<Json<Vec<Group>>, AppError> {
    Ok(Json(state.db.search_groups(&params.query, SEARCH_LIMIT).await?))
}

#[derive(Debug, Deserialize)]
struct DayQuery {
    week_type: Option<String>,
}

async fn group_schedule(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
) -> Result<Json<Vec<LessonView>>, AppError> {
    let group = require_group(&state.db, id).await?;
    Ok(Json(state.db.group_lessons(group.id, None, None).await?))
}

async fn group_day(
    State(state): State<Arc<AppState>>,
    ApiPath((id, weekday)): ApiPath<(i64, i64)>,
    ApiQuery(params): ApiQuery<DayQuery>,
) -> Result<Json<Vec<LessonView>>, AppError> {
    let weekday = parse_weekday(weekday)?;
    let week = parse_week_type(params.week_type.as_deref())?;
    let group = require_group(&state.db, id).await?;
    Ok(Json(state.db.group_lessons(group.id, Some(weekday), week).await?))
}

async fn group_today(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
) -> Result<Json<Vec<DatedLesson>>, AppError> {
    let group = require_group(&state.db, id).await?;
    Ok(Json(query::lessons_on(&state.db, group.id, query::today()).await?))
}

async fn group_tomorrow(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
) -> Result<Json<Vec<DatedLesson>>, AppError> {
    let group = require_group(&state.db, id).await?;
    Ok(Json(query::lessons_on(&state.db, group.id, query::tomorrow()).await?))
}

#[derive(Debug, Deserialize)]
struct SelectGroupRequest {
    group_id: i64,
}

#[derive(Debug, Serialize)]
struct UserGroupResponse {
    group_id: i64,
    group_number: String,
    group_name: String,
}

impl From<Group> for UserGroupResponse {
    fn from(group: Group) -> Self {
        Self {
            group_id: group.id,
            group_number: group.number,
            group_name: group.name,
        }
    }
}

async fn select_group(
    State(state): State<Arc<AppState>>,
    ApiPath(user_id): ApiPath<i64>,
    ApiJson(request): ApiJson<SelectGroupRequest>,
) -> Result<impl IntoResponse, AppError> {
    let group = require_group(&state.db, request.group_id).await?;
    state.db.select_user_group(user_id, &group.number).await?;

    let message = format!("Группа {} ({}) успешно выбрана", group.number, group.name);
    Ok(Json(json!({
        "message": message,
        "group_id": group.id,
        "group_number": group.number,
        "group_name": group.name,
    })))
}

async fn user_group(
    State(state): State<Arc<AppState>>,
    ApiPath(user_id): ApiPath<i64>,
) -> Result<Json<UserGroupResponse>, AppError> {
    let group = selected_group(&state.db, user_id).await?;
    Ok(Json(group.into()))
}

async fn user_schedule(
    State(state): State<Arc<AppState>>,
    ApiPath(user_id): ApiPath<i64>,
) -> Result<Json<Vec<LessonView>>, AppError> {
    let group = selected_group(&state.db, user_id).await?;
    Ok(Json(state.db.group_lessons(group.id, None, None).await?))
}

async fn user_day(
    State(state): State<Arc<AppState>>,
    ApiPath((user_id, weekday)): ApiPath<(i64, i64)>,
    ApiQuery(params): ApiQuery<DayQuery>,
) -> Result<Json<Vec<LessonView>>, AppError> {
    let weekday = parse_weekday(weekday)?;
    let week = parse_week_type(params.week_type.as_deref())?;
    let group = selected_group(&state.db, user_id).await?;
    Ok(Json(state.db.group_lessons(group.id, Some(weekday), week).await?))
}

async fn user_today(
    State(state): State<Arc<AppState>>,
    ApiPath(user_id): ApiPath<i64>,
) -> Result<Json<Vec<DatedLesson>>, AppError> {
    let group = selected_group(&state.db, user_id).await?;
    Ok(Json(query::lessons_on(&state.db, group.id, query::today()).await?))
}

async fn user_tomorrow(
    State(state): State<Arc<AppState>>,
    ApiPath(user_id): ApiPath<i64>,
) -> Result<Json<Vec<DatedLesson>>, AppError> {
    let group = selected_group(&state.db, user_id).await?;
    Ok(Json(query::lessons_on(&state.db, group.id, query::tomorrow()).await?))
}

async fn require_group(db: &Database, id: i64) -> Result<Group, AppError> {
    db.get_group(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Группа с id {} не найдена", id)))
}

/// The user's stored group number resolved against the current generation.
async fn selected_group(db: &Database, user_id: i64) -> Result<Group, AppError> {
    let number = db
        .user_group_number(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Вы еще не выбрали группу".to_string()))?;

    db.find_group_by_number(&number).await?.ok_or_else(|| {
        AppError::NotFound(format!("Группа {} отсутствует в текущем расписании", number))
    })
}

fn parse_weekday(weekday: i64) -> Result<u8, AppError> {
    match u8::try_from(weekday) {
        Ok(day) if day <= 6 => Ok(day),
        _ => Err(AppError::BadRequest(
            "День недели должен быть числом от 0 (понедельник) до 6 (воскресенье)".to_string(),
        )),
    }
}

fn parse_week_type(value: Option<&str>) -> Result<Option<WeekType>, AppError> {
    value
        .map(|v| v.parse::<WeekType>().map_err(AppError::BadRequest))
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::fetcher::StaticPages;
    use crate::models::SourcePage;

    const PAGE: &str = r#"
        <table>
          <tr><th>Пара</th><th>Понедельник</th><th>Вторник</th></tr>
          <tr><td>1</td><td>Матанализ, Иванов И.И., 101, ауд.305, нижняя неделя</td><td></td></tr>
          <tr><td>2</td><td>Физика, Петров П.П., 101, 102А, ауд.1</td><td>Химия, 102А</td></tr>
        </table>"#;

    async fn app(admin_token: Option<&str>) -> (Router, Arc<Database>, Arc<Importer>) {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let pages = StaticPages::new(vec![SourcePage::new("http://example.com/1/1/1.htm", PAGE)]);
        let importer = Arc::new(Importer::new(
            Arc::new(pages),
            db.clone(),
            CancellationToken::new(),
        ));

        let state = AppState {
            db: db.clone(),
            importer: importer.clone(),
        };
        (
            create_router(state, admin_token.map(str::to_string)),
            db,
            importer,
        )
    }

    async fn seeded_app() -> (Router, Arc<Database>) {
        let (router, db, importer) = app(None).await;
        importer.run_once(false).await.unwrap();
        (router, db)
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn group_id(db: &Database, number: &str) -> i64 {
        db.find_group_by_number(number).await.unwrap().unwrap().id
    }

    #[tokio::test]
    async fn test_update_requires_admin_token() {
        let (router, db, importer) = app(Some("secret")).await;

        let (status, body) = send(
            &router,
            post_json("/timetable/update", json!({ "force_update": true }), None),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["detail"].is_string());

        let (status, _) = send(
            &router,
            post_json("/timetable/update", json!({ "force_update": true }), Some("wrong")),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(
            &router,
            post_json("/timetable/update", json!({ "force_update": true }), Some("secret")),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "started");

        for _ in 0..200 {
            if !importer.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!importer.is_running());
        assert_eq!(db.table_counts().await.unwrap().lessons, 3);
    }

    #[tokio::test]
    async fn test_search_group() {
        let (router, _db) = seeded_app().await;

        let (status, body) = send(&router, get("/timetable/search_group?query=102%D0%B0")).await;
        assert_eq!(status, StatusCode::OK);
        let groups = body.as_array().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0]["number"], "102А");

        let (_, body) = send(&router, get("/timetable/search_group?query=10")).await;
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_group_schedule_and_day() {
        let (router, db) = seeded_app().await;
        let id = group_id(&db, "101").await;

        let (status, body) = send(&router, get(&format!("/timetable/group/{}/schedule", id))).await;
        assert_eq!(status, StatusCode::OK);
        let lessons = body.as_array().unwrap();
        assert_eq!(lessons.len(), 2);
        assert_eq!(lessons[0]["subject"], "Матанализ");
        assert_eq!(lessons[0]["weekday_name"], "Понедельник");
        assert_eq!(lessons[0]["start_time"], "09:00");
        assert_eq!(lessons[0]["week_type"], "lower");
        assert_eq!(lessons[1]["subject"], "Физика");
        assert_eq!(lessons[1]["week_type"], "both");

        let (_, body) = send(
            &router,
            get(&format!("/timetable/group/{}/day/0?week_type=upper", id)),
        )
        .await;
        let lessons = body.as_array().unwrap();
        assert_eq!(lessons.len(), 1);
        assert_eq!(lessons[0]["subject"], "Физика");

        let (_, body) = send(
            &router,
            get(&format!("/timetable/group/{}/day/0?week_type=lower", id)),
        )
        .await;
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_group_errors() {
        let (router, db) = seeded_app().await;
        let id = group_id(&db, "101").await;

        let (status, body) = send(&router, get("/timetable/group/999/schedule")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["detail"].as_str().unwrap().contains("999"));

        let (status, _) = send(&router, get(&format!("/timetable/group/{}/day/7", id))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&router, get(&format!("/timetable/group/{}/day/-1", id))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &router,
            get(&format!("/timetable/group/{}/day/1?week_type=middle", id)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap().contains("middle"));
    }

    #[tokio::test]
    async fn test_extractor_rejections_use_detail_body() {
        let (router, db) = seeded_app().await;
        let id = group_id(&db, "101").await;

        let (status, body) = send(&router, get("/timetable/group/abc/schedule")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].is_string());

        let (status, body) = send(&router, get(&format!("/timetable/group/{}/day/x", id))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].is_string());

        let (status, body) = send(&router, get("/timetable/search_group")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].is_string());

        let (status, body) = send(&router, get("/timetable/imports?limit=many")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].is_string());

        let malformed = Request::builder()
            .method("POST")
            .uri("/timetable/user/5/select-group")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"group_id\":"))
            .unwrap();
        let (status, body) = send(&router, malformed).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].is_string());

        let (status, body) = send(
            &router,
            post_json("/timetable/user/5/select-group", json!({ "group": 1 }), None),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["detail"].is_string());
    }

    #[tokio::test]
    async fn test_group_today_carries_date() {
        let (router, db) = seeded_app().await;
        let id = group_id(&db, "102А").await;

        let (status, body) = send(&router, get(&format!("/timetable/group/{}/today", id))).await;
        assert_eq!(status, StatusCode::OK);
        let expected = query::today().format("%d.%m.%Y").to_string();
        for lesson in body.as_array().unwrap() {
            assert_eq!(lesson["date"], expected.as_str());
        }

        let (status, _) = send(&router, get("/timetable/group/999/tomorrow")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_user_group_selection() {
        let (router, db) = seeded_app().await;
        let id = group_id(&db, "102А").await;

        let (status, _) = send(&router, get("/timetable/user/5/group")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&router, get("/timetable/user/5/schedule")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &router,
            post_json("/timetable/user/5/select-group", json!({ "group_id": 999 }), None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(
            &router,
            post_json("/timetable/user/5/select-group", json!({ "group_id": id }), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["group_number"], "102А");

        let (status, body) = send(&router, get("/timetable/user/5/group")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["group_id"], id);

        let (_, body) = send(&router, get("/timetable/user/5/schedule")).await;
        let subjects: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|l| l["subject"].as_str().unwrap())
            .collect();
        assert_eq!(subjects, vec!["Физика", "Химия"]);

        let (_, body) = send(&router, get("/timetable/user/5/schedule/day/1")).await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = send(&router, get("/timetable/user/5/schedule/day/9")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&router, get("/timetable/user/5/schedule/tomorrow")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_import_endpoints() {
        let (router, _db) = seeded_app().await;

        let (status, body) = send(&router, get("/timetable/imports")).await;
        assert_eq!(status, StatusCode::OK);
        let runs = body.as_array().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0]["status"], "succeeded");
        let run_id = runs[0]["id"].as_i64().unwrap();

        let (status, body) = send(&router, get("/timetable/imports/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["running"], false);
        assert_eq!(body["db_type"], "memory");
        assert_eq!(body["counts"]["lessons"], 3);
        assert_eq!(body["last_run"]["id"], run_id);

        let (status, body) = send(&router, get(&format!("/timetable/imports/{}", run_id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["lessons"], 3);

        let (status, _) = send(&router, get("/timetable/imports/999")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
