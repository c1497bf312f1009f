use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use axum::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::json;
use training_results_client::HttpUserService;
use training_results_core::{
    now_utc, AccessAction, AccessPolicy, Actor, NewTest, NewTestResult, RecordTarget,
    ResultFilter, Role, StatsUpdate, TestPatch, TestRecord, TestResultPatch, TestResultRecord,
    TestType, TrainingError, UserService,
};
use training_results_store_sqlite::{SqliteResultStore, TestDeletion};

#[derive(Clone)]
struct ServiceState {
    db_path: PathBuf,
    users: Arc<dyn UserService>,
    queue: SyncQueue,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ApiEnvelope<T>
where
    T: Serialize,
{
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    queue_depth: usize,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    unauthorized_total: AtomicU64,
    forbidden_total: AtomicU64,
    not_found_total: AtomicU64,
    write_conflict_total: AtomicU64,
    delegate_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    unauthorized_total: u64,
    forbidden_total: u64,
    not_found_total: u64,
    write_conflict_total: u64,
    delegate_unavailable_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "training-results-service")]
#[command(about = "HTTP service for athlete test results")]
struct Args {
    #[arg(long, default_value = "./training_results.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Base URL of the identity service that owns users and teams.
    #[arg(long, default_value = "http://127.0.0.1:4000")]
    user_service_url: String,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
    /// Pause between drained profile-sync jobs.
    #[arg(long, default_value_t = 100)]
    sync_delay_ms: u64,
    #[arg(long, default_value_t = 5000)]
    remote_timeout_ms: u64,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let mut body = json!({
            "status": "error",
            "message": self.message,
        });
        if let Some(details) = self.details {
            body["details"] = details;
        }
        (self.status, Json(body)).into_response()
    }
}

/// Authenticated caller, extracted from a gateway-minted JWT. The gateway
/// already verified the signature; this service only reads the claims, the
/// same trust split the identity deployment uses for its other backends.
#[derive(Debug, Clone)]
struct AuthUser {
    id: i64,
    role: Role,
    token: String,
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    user: TokenUser,
    #[serde(default)]
    exp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenUser {
    id: i64,
    role: Role,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

#[async_trait]
impl FromRequestParts<ServiceState> for AuthUser {
    type Rejection = ServiceFailure;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ServiceState,
    ) -> Result<Self, Self::Rejection> {
        let Some(token) = extract_token(parts) else {
            state.telemetry.record_failure("unauthorized", false);
            return Err(ServiceState::failure(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "authentication required",
                None,
            ));
        };

        let claims = decode_claims(&token).map_err(|reason| {
            state.telemetry.record_failure("unauthorized", false);
            ServiceState::failure(StatusCode::UNAUTHORIZED, "unauthorized", reason, None)
        })?;

        if let Some(exp) = claims.exp {
            if exp <= now_utc().unix_timestamp() {
                state.telemetry.record_failure("unauthorized", false);
                return Err(ServiceState::failure(
                    StatusCode::UNAUTHORIZED,
                    "unauthorized",
                    "authentication token has expired",
                    None,
                ));
            }
        }

        if !claims.user.active {
            state.telemetry.record_failure("forbidden", false);
            return Err(ServiceState::failure(
                StatusCode::FORBIDDEN,
                "forbidden",
                "account is deactivated",
                None,
            ));
        }

        Ok(Self {
            id: claims.user.id,
            role: claims.user.role,
            token,
        })
    }
}

fn extract_token(parts: &Parts) -> Option<String> {
    if let Some(value) = parts.headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }

    parts
        .headers
        .get("x-auth-token")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn decode_claims(token: &str) -> Result<TokenClaims, String> {
    let mut segments = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err("authentication token MUST have three segments".to_string());
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|err| format!("invalid authentication token encoding: {err}"))?;
    serde_json::from_slice(&bytes).map_err(|err| format!("invalid authentication claims: {err}"))
}

type SyncTask = Pin<Box<dyn Future<Output = Result<(), TrainingError>> + Send + 'static>>;

struct SyncJob {
    label: String,
    task: SyncTask,
}

struct QueueInner {
    jobs: VecDeque<SyncJob>,
    draining: bool,
}

/// Best-effort FIFO queue for profile-sync pushes. One drain task runs at a
/// time; a failed job is logged and dropped so a dead identity service never
/// blocks result writes.
#[derive(Clone)]
struct SyncQueue {
    inner: Arc<Mutex<QueueInner>>,
    delay: Duration,
}

impl SyncQueue {
    fn new(delay: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                jobs: VecDeque::new(),
                draining: false,
            })),
            delay,
        }
    }

    fn enqueue(&self, label: impl Into<String>, task: SyncTask) {
        let label = label.into();
        let start_drain = {
            let mut inner = lock(&self.inner);
            inner.jobs.push_back(SyncJob { label, task });
            if inner.draining {
                false
            } else {
                inner.draining = true;
                true
            }
        };

        if start_drain {
            let queue = self.clone();
            tokio::spawn(async move {
                queue.drain().await;
            });
        }
    }

    async fn drain(&self) {
        loop {
            let job = {
                let mut inner = lock(&self.inner);
                match inner.jobs.pop_front() {
                    Some(job) => job,
                    None => {
                        inner.draining = false;
                        return;
                    }
                }
            };

            if let Err(err) = job.task.await {
                tracing::warn!(job = %job.label, error = %err, "profile sync job failed; dropping");
            }

            tokio::time::sleep(self.delay).await;
        }
    }

    fn depth(&self) -> usize {
        lock(&self.inner).jobs.len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
            details,
        }
    }

    fn invalid_json(rejection: &JsonRejection) -> ServiceFailure {
        Self::failure(
            StatusCode::BAD_REQUEST,
            "invalid_json",
            rejection.body_text(),
            Some(json!({ "rejection": rejection.to_string() })),
        )
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::invalid_json(rejection)
    }

    fn validation_failure(&self, message: impl Into<String>) -> ServiceFailure {
        self.telemetry.record_failure("validation_error", false);
        Self::failure(
            StatusCode::BAD_REQUEST,
            "validation_error",
            message,
            None,
        )
    }

    fn domain_failure(&self, err: &TrainingError) -> ServiceFailure {
        let failure = map_domain_error(err);
        self.telemetry.record_failure(failure.code, false);
        failure
    }

    fn classify_api_error(err: &anyhow::Error) -> ServiceFailure {
        if let Some(domain) = err.downcast_ref::<TrainingError>() {
            return map_domain_error(domain);
        }

        let message = err.to_string();
        let normalized = format!("{err:#}").to_ascii_lowercase();

        if normalized.contains("not found") {
            return Self::failure(StatusCode::NOT_FOUND, "not_found", message, None);
        }

        if normalized.contains("unique constraint failed")
            || normalized.contains("foreign key constraint failed")
            || normalized.contains("already exists")
        {
            return Self::failure(StatusCode::CONFLICT, "write_conflict", message, None);
        }

        if normalized.contains("must") || normalized.contains("validation") {
            return Self::failure(StatusCode::BAD_REQUEST, "validation_error", message, None);
        }

        if normalized.contains("sqlite") || normalized.contains("database") {
            return Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                message,
                None,
            );
        }

        Self::failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            message,
            None,
        )
    }

    async fn run_blocking<T, F>(
        &self,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteResultStore) -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let db_path = self.db_path.clone();
        let handle = tokio::task::spawn_blocking(move || -> anyhow::Result<T> {
            let mut store = SqliteResultStore::open(&db_path)?;
            op(&mut store)
        });

        let join_result = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                self.telemetry.record_failure("internal_error", true);
                Self::failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry
                    .requests_success_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_api_error(&err);
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }

    async fn authorize(
        &self,
        auth: &AuthUser,
        action: &AccessAction,
    ) -> Result<(), ServiceFailure> {
        let actor = Actor {
            id: auth.id,
            role: auth.role,
        };
        let decision = AccessPolicy::decide(&actor, action, self.users.as_ref(), &auth.token)
            .await
            .map_err(|err| self.domain_failure(&err))?;

        if decision.allowed {
            Ok(())
        } else {
            self.telemetry.record_failure("forbidden", false);
            Err(Self::failure(
                StatusCode::FORBIDDEN,
                "forbidden",
                decision.reason,
                None,
            ))
        }
    }

    fn require_staff(&self, auth: &AuthUser) -> Result<(), ServiceFailure> {
        if auth.role.is_staff() {
            return Ok(());
        }
        self.telemetry.record_failure("forbidden", false);
        Err(Self::failure(
            StatusCode::FORBIDDEN,
            "forbidden",
            "only admin or team_admin may manage the test catalog",
            None,
        ))
    }

    fn require_admin(&self, auth: &AuthUser) -> Result<(), ServiceFailure> {
        if auth.role.is_admin() {
            return Ok(());
        }
        self.telemetry.record_failure("forbidden", false);
        Err(Self::failure(
            StatusCode::FORBIDDEN,
            "forbidden",
            "only admin may delete catalog tests",
            None,
        ))
    }

    /// Queues a best-effort profile push for one result. The snapshot is
    /// re-read when the job drains so a quick follow-up edit wins.
    fn enqueue_profile_sync(&self, result_id: i64, token: String) {
        let db_path = self.db_path.clone();
        let users = Arc::clone(&self.users);
        let task: SyncTask = Box::pin(async move {
            let (user_id, update) = tokio::task::spawn_blocking(
                move || -> anyhow::Result<(i64, StatsUpdate)> {
                    let store = SqliteResultStore::open(&db_path)?;
                    store.sync_snapshot(result_id)
                },
            )
            .await
            .map_err(|err| TrainingError::Server(format!("sync snapshot join failure: {err}")))?
            .map_err(|err| match err.downcast_ref::<TrainingError>() {
                Some(domain) => domain.clone(),
                None => TrainingError::Server(err.to_string()),
            })?;

            users.update_user_stats(user_id, &update, &token).await
        });

        self.queue.enqueue(format!("profile-sync-{result_id}"), task);
    }
}

fn map_domain_error(err: &TrainingError) -> ServiceFailure {
    let message = err.to_string();
    match err {
        TrainingError::Validation(_) => ServiceState::failure(
            StatusCode::BAD_REQUEST,
            "validation_error",
            message,
            None,
        ),
        TrainingError::NotFound(_) => {
            ServiceState::failure(StatusCode::NOT_FOUND, "not_found", message, None)
        }
        TrainingError::Forbidden(_) => {
            ServiceState::failure(StatusCode::FORBIDDEN, "forbidden", message, None)
        }
        TrainingError::Conflict(_) => {
            ServiceState::failure(StatusCode::CONFLICT, "write_conflict", message, None)
        }
        TrainingError::Unauthorized(_) => {
            ServiceState::failure(StatusCode::UNAUTHORIZED, "unauthorized", message, None)
        }
        TrainingError::Delegate(_) => ServiceState::failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "delegate_unavailable",
            message,
            None,
        ),
        TrainingError::Server(_) => ServiceState::failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            message,
            None,
        ),
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match code {
            "invalid_json" => {
                self.invalid_json_total.fetch_add(1, Ordering::Relaxed);
            }
            "validation_error" => {
                self.validation_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "unauthorized" => {
                self.unauthorized_total.fetch_add(1, Ordering::Relaxed);
            }
            "forbidden" => {
                self.forbidden_total.fetch_add(1, Ordering::Relaxed);
            }
            "not_found" => {
                self.not_found_total.fetch_add(1, Ordering::Relaxed);
            }
            "write_conflict" => {
                self.write_conflict_total.fetch_add(1, Ordering::Relaxed);
            }
            "delegate_unavailable" => {
                self.delegate_unavailable_total.fetch_add(1, Ordering::Relaxed);
            }
            "internal_error" => {
                self.internal_error_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.other_error_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            unauthorized_total: self.unauthorized_total.load(Ordering::Relaxed),
            forbidden_total: self.forbidden_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            write_conflict_total: self.write_conflict_total.load(Ordering::Relaxed),
            delegate_unavailable_total: self.delegate_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ApiEnvelope<T>
where
    T: Serialize,
{
    ApiEnvelope {
        status: "success",
        message: None,
        count: None,
        data: Some(data),
    }
}

fn message_envelope<T>(message: impl Into<String>, data: T) -> ApiEnvelope<T>
where
    T: Serialize,
{
    ApiEnvelope {
        status: "success",
        message: Some(message.into()),
        count: None,
        data: Some(data),
    }
}

fn listing_envelope<T>(items: Vec<T>) -> ApiEnvelope<Vec<T>>
where
    T: Serialize,
{
    ApiEnvelope {
        status: "success",
        message: None,
        count: Some(items.len()),
        data: Some(items),
    }
}

fn ack_envelope(message: impl Into<String>) -> ApiEnvelope<serde_json::Value> {
    ApiEnvelope {
        status: "success",
        message: Some(message.into()),
        count: None,
        data: None,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/test-results", post(result_create).get(result_list))
        .route(
            "/v1/test-results/:id",
            get(result_show).put(result_update).delete(result_delete),
        )
        .route(
            "/v1/test-results/user/:user_id/test/:test_id",
            get(result_history),
        )
        .route(
            "/v1/test-results/team/:team_id/test/:test_id",
            get(team_stats),
        )
        .route("/v1/tests", get(test_list).post(test_create))
        .route(
            "/v1/tests/:id",
            get(test_show).put(test_update).delete(test_delete),
        )
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let store = SqliteResultStore::open(&args.db)?;
    store.migrate()?;
    drop(store);

    let users = HttpUserService::new(
        args.user_service_url.clone(),
        Duration::from_millis(args.remote_timeout_ms),
    )
    .map_err(|err| anyhow::anyhow!("{err}"))?;

    let state = ServiceState {
        db_path: args.db,
        users: Arc::new(users),
        queue: SyncQueue::new(Duration::from_millis(args.sync_delay_ms)),
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "training-results-service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ApiEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms,
        queue_depth: state.queue.depth(),
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn result_create(
    State(state): State<ServiceState>,
    auth: AuthUser,
    payload: Result<Json<NewTestResult>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiEnvelope<TestResultRecord>>), ServiceFailure> {
    let Json(input) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    input
        .validate()
        .map_err(|err| state.domain_failure(&err))?;

    state
        .authorize(
            &auth,
            &AccessAction::CreateRecord {
                subject_user_id: input.user_id,
                team_id: input.team_id,
            },
        )
        .await?;

    let created_by = auth.id;
    let created = state
        .run_blocking("result_create", move |store| {
            store.create_result(&input, created_by)
        })
        .await?;

    state.enqueue_profile_sync(created.id, auth.token);

    Ok((
        StatusCode::CREATED,
        Json(message_envelope("Test result recorded", created)),
    ))
}

async fn result_list(
    State(state): State<ServiceState>,
    auth: AuthUser,
    Query(mut filter): Query<ResultFilter>,
) -> Result<Json<ApiEnvelope<Vec<TestResultRecord>>>, ServiceFailure> {
    filter
        .validate()
        .map_err(|err| state.domain_failure(&err))?;

    // Unprivileged callers without an explicit subject see their own rows.
    if !auth.role.is_staff() && auth.role != Role::Coach && filter.user_id.is_none() {
        filter.user_id = Some(auth.id);
    }

    state
        .authorize(
            &auth,
            &AccessAction::ListRecords {
                user_id: filter.user_id,
                team_id: filter.team_id,
            },
        )
        .await?;

    let rows = state
        .run_blocking("result_list", move |store| store.list_results(&filter))
        .await?;
    Ok(Json(listing_envelope(rows)))
}

async fn result_show(
    State(state): State<ServiceState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<ApiEnvelope<TestResultRecord>>, ServiceFailure> {
    let record = state
        .run_blocking("result_show", move |store| store.get_result(id))
        .await?;

    state
        .authorize(&auth, &AccessAction::ReadRecord(RecordTarget::of(&record)))
        .await?;

    Ok(Json(envelope(record)))
}

async fn result_update(
    State(state): State<ServiceState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    payload: Result<Json<TestResultPatch>, JsonRejection>,
) -> Result<Json<ApiEnvelope<TestResultRecord>>, ServiceFailure> {
    let Json(patch) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    patch
        .validate()
        .map_err(|err| state.domain_failure(&err))?;

    let existing = state
        .run_blocking("result_load", move |store| store.get_result(id))
        .await?;
    state
        .authorize(
            &auth,
            &AccessAction::UpdateRecord(RecordTarget::of(&existing)),
        )
        .await?;

    let updated_by = auth.id;
    let updated = state
        .run_blocking("result_update", move |store| {
            store.update_result(id, &patch, updated_by)
        })
        .await?;

    state.enqueue_profile_sync(updated.id, auth.token);

    Ok(Json(message_envelope("Test result updated", updated)))
}

async fn result_delete(
    State(state): State<ServiceState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<ApiEnvelope<serde_json::Value>>, ServiceFailure> {
    let existing = state
        .run_blocking("result_load", move |store| store.get_result(id))
        .await?;
    state
        .authorize(
            &auth,
            &AccessAction::DeleteRecord(RecordTarget::of(&existing)),
        )
        .await?;

    state
        .run_blocking("result_delete", move |store| store.delete_result(id))
        .await?;

    Ok(Json(ack_envelope("Test result deleted")))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    start_date: Option<String>,
    end_date: Option<String>,
    limit: Option<usize>,
}

async fn result_history(
    State(state): State<ServiceState>,
    auth: AuthUser,
    Path((user_id, test_id)): Path<(i64, i64)>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ApiEnvelope<Vec<TestResultRecord>>>, ServiceFailure> {
    let limit = query.limit.unwrap_or(10);
    if limit == 0 || limit > 100 {
        return Err(state.validation_failure("limit MUST be between 1 and 100"));
    }

    state
        .authorize(
            &auth,
            &AccessAction::ReadHistory {
                subject_user_id: user_id,
            },
        )
        .await?;

    let rows = state
        .run_blocking("result_history", move |store| {
            store.user_history(
                user_id,
                test_id,
                query.start_date.as_deref(),
                query.end_date.as_deref(),
                limit,
            )
        })
        .await?;
    Ok(Json(listing_envelope(rows)))
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    date: Option<String>,
}

async fn team_stats(
    State(state): State<ServiceState>,
    auth: AuthUser,
    Path((team_id, test_id)): Path<(i64, i64)>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<ApiEnvelope<Vec<TestResultRecord>>>, ServiceFailure> {
    state
        .authorize(&auth, &AccessAction::ReadTeam { team_id })
        .await?;

    let rows = state
        .run_blocking("team_stats", move |store| {
            store.team_statistics(team_id, test_id, query.date.as_deref())
        })
        .await?;
    Ok(Json(listing_envelope(rows)))
}

#[derive(Debug, Deserialize)]
struct TestListQuery {
    #[serde(rename = "type")]
    test_type: Option<TestType>,
    #[serde(default)]
    include_inactive: bool,
}

async fn test_list(
    State(state): State<ServiceState>,
    auth: AuthUser,
    Query(query): Query<TestListQuery>,
) -> Result<Json<ApiEnvelope<Vec<TestRecord>>>, ServiceFailure> {
    // Only admin may see deactivated catalog entries.
    let include_inactive = query.include_inactive && auth.role.is_admin();
    let rows = state
        .run_blocking("test_list", move |store| {
            store.list_tests(query.test_type, include_inactive)
        })
        .await?;
    Ok(Json(listing_envelope(rows)))
}

async fn test_create(
    State(state): State<ServiceState>,
    auth: AuthUser,
    payload: Result<Json<NewTest>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiEnvelope<TestRecord>>), ServiceFailure> {
    state.require_staff(&auth)?;
    let Json(input) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    input
        .validate()
        .map_err(|err| state.domain_failure(&err))?;

    let created_by = auth.id;
    let created = state
        .run_blocking("test_create", move |store| {
            store.create_test(&input, created_by)
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(message_envelope("Test created", created)),
    ))
}

async fn test_show(
    State(state): State<ServiceState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<ApiEnvelope<TestRecord>>, ServiceFailure> {
    let record = state
        .run_blocking("test_show", move |store| store.get_test(id))
        .await?;

    if !record.is_active && !auth.role.is_admin() {
        state.telemetry.record_failure("forbidden", false);
        return Err(ServiceState::failure(
            StatusCode::FORBIDDEN,
            "forbidden",
            "inactive tests are visible to admin only",
            None,
        ));
    }

    Ok(Json(envelope(record)))
}

async fn test_update(
    State(state): State<ServiceState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    payload: Result<Json<TestPatch>, JsonRejection>,
) -> Result<Json<ApiEnvelope<TestRecord>>, ServiceFailure> {
    state.require_staff(&auth)?;
    let Json(patch) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    patch
        .validate()
        .map_err(|err| state.domain_failure(&err))?;

    let updated = state
        .run_blocking("test_update", move |store| store.update_test(id, &patch))
        .await?;
    Ok(Json(message_envelope("Test updated", updated)))
}

async fn test_delete(
    State(state): State<ServiceState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<ApiEnvelope<serde_json::Value>>, ServiceFailure> {
    state.require_admin(&auth)?;

    let outcome = state
        .run_blocking("test_delete", move |store| store.delete_test(id))
        .await?;

    let message = match outcome {
        TestDeletion::Removed => "Test deleted",
        TestDeletion::Deactivated => "Test deactivated; stored results still reference it",
    };
    Ok(Json(ack_envelope(message)))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;
    use training_results_client::FakeUserService;
    use training_results_core::{TeamMembership, UserProfile};

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("training-results-{}.sqlite3", ulid::Ulid::new()))
    }

    fn migrated_db_path() -> PathBuf {
        let db_path = unique_temp_db_path();
        let store = match SqliteResultStore::open(&db_path) {
            Ok(store) => store,
            Err(err) => panic!("failed to open test database: {err}"),
        };
        if let Err(err) = store.migrate() {
            panic!("failed to migrate test database: {err:#}");
        }
        db_path
    }

    fn test_state(db_path: PathBuf, users: Arc<FakeUserService>) -> ServiceState {
        ServiceState {
            db_path,
            users,
            queue: SyncQueue::new(Duration::from_millis(1)),
            operation_timeout: Duration::from_millis(2500),
            telemetry: Arc::new(ServiceTelemetry::default()),
        }
    }

    fn token_with_exp(user_id: i64, role: &str, active: bool, exp: Option<i64>) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let claims = json!({
            "user": { "id": user_id, "role": role, "active": active },
            "exp": exp,
        });
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{header}.{payload}.testsignature")
    }

    fn token_for(user_id: i64, role: &str) -> String {
        token_with_exp(user_id, role, true, Some(now_utc().unix_timestamp() + 3600))
    }

    fn request(
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> Request<axum::body::Body> {
        let mut builder = Request::builder().uri(uri).method(method);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(axum::body::Body::from(body.to_string())),
            None => builder.body(axum::body::Body::empty()),
        };
        request.unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    async fn send(
        router: Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> Response {
        match router.oneshot(request(method, uri, token, body)).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn seed_catalog_test(router: Router, admin_token: &str, name: &str) -> i64 {
        let response = send(
            router,
            "POST",
            "/v1/tests",
            Some(admin_token),
            Some(json!({
                "name": name,
                "test_type": "strength",
                "unit": "kg",
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let value = response_json(response).await;
        match value
            .get("data")
            .and_then(|data| data.get("id"))
            .and_then(serde_json::Value::as_i64)
        {
            Some(id) => id,
            None => panic!("catalog create response carried no id: {value}"),
        }
    }

    fn result_payload(test_id: i64, user_id: i64, date: &str, value: f64) -> serde_json::Value {
        json!({
            "test_id": test_id,
            "user_id": user_id,
            "team_id": 3,
            "test_date": date,
            "result": value,
            "unit": "kg",
            "test_type": "strength",
        })
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok_without_auth() {
        let state = test_state(migrated_db_path(), Arc::new(FakeUserService::new()));
        let response = send(app(state), "GET", "/v1/health", None, None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("status").and_then(serde_json::Value::as_str),
            Some("success")
        );
        assert_eq!(
            value
                .get("data")
                .and_then(|data| data.get("status"))
                .and_then(serde_json::Value::as_str),
            Some("ok")
        );
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let state = test_state(migrated_db_path(), Arc::new(FakeUserService::new()));
        let response = send(app(state), "GET", "/v1/test-results", None, None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let value = response_json(response).await;
        assert_eq!(
            value.get("status").and_then(serde_json::Value::as_str),
            Some("error")
        );
    }

    #[tokio::test]
    async fn malformed_token_is_unauthorized() {
        let state = test_state(migrated_db_path(), Arc::new(FakeUserService::new()));
        let response = send(
            app(state),
            "GET",
            "/v1/test-results",
            Some("not-a-jwt"),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn expired_token_is_unauthorized() {
        let state = test_state(migrated_db_path(), Arc::new(FakeUserService::new()));
        let token = token_with_exp(7, "player", true, Some(now_utc().unix_timestamp() - 60));
        let response = send(app(state), "GET", "/v1/test-results", Some(&token), None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn deactivated_account_is_forbidden() {
        let state = test_state(migrated_db_path(), Arc::new(FakeUserService::new()));
        let token = token_with_exp(7, "player", false, Some(now_utc().unix_timestamp() + 3600));
        let response = send(app(state), "GET", "/v1/test-results", Some(&token), None).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn x_auth_token_header_is_accepted() {
        let state = test_state(migrated_db_path(), Arc::new(FakeUserService::new()));
        let token = token_for(7, "player");
        let request = Request::builder()
            .uri("/v1/test-results")
            .method("GET")
            .header("x-auth-token", token)
            .body(axum::body::Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));

        let response = match app(state).oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_computes_the_change_chain() {
        let state = test_state(migrated_db_path(), Arc::new(FakeUserService::new()));
        let admin = token_for(1, "admin");
        let player = token_for(7, "player");
        let test_id = seed_catalog_test(app(state.clone()), &admin, "Bench Press").await;

        let first = send(
            app(state.clone()),
            "POST",
            "/v1/test-results",
            Some(&player),
            Some(result_payload(test_id, 7, "2026-05-01", 100.0)),
        )
        .await;
        assert_eq!(first.status(), StatusCode::CREATED);
        let first = response_json(first).await;
        assert_eq!(
            first.get("message").and_then(serde_json::Value::as_str),
            Some("Test result recorded")
        );
        assert!(first
            .get("data")
            .and_then(|data| data.get("comparison_to_previous"))
            .map_or(true, serde_json::Value::is_null));

        let second = send(
            app(state.clone()),
            "POST",
            "/v1/test-results",
            Some(&player),
            Some(result_payload(test_id, 7, "2026-05-08", 110.0)),
        )
        .await;
        let second = response_json(second).await;
        assert_eq!(
            second
                .get("data")
                .and_then(|data| data.get("comparison_to_previous"))
                .and_then(serde_json::Value::as_f64),
            Some(10.0)
        );

        let third = send(
            app(state),
            "POST",
            "/v1/test-results",
            Some(&player),
            Some(result_payload(test_id, 7, "2026-05-15", 99.0)),
        )
        .await;
        let third = response_json(third).await;
        assert_eq!(
            third
                .get("data")
                .and_then(|data| data.get("comparison_to_previous"))
                .and_then(serde_json::Value::as_f64),
            Some(-10.0)
        );
    }

    #[tokio::test]
    async fn player_cannot_record_for_another_user() {
        let state = test_state(migrated_db_path(), Arc::new(FakeUserService::new()));
        let admin = token_for(1, "admin");
        let player = token_for(7, "player");
        let test_id = seed_catalog_test(app(state.clone()), &admin, "Bench Press").await;

        let payload = json!({
            "test_id": test_id,
            "user_id": 8,
            "test_date": "2026-05-01",
            "result": 100.0,
            "unit": "kg",
            "test_type": "strength",
        });
        let response = send(
            app(state),
            "POST",
            "/v1/test-results",
            Some(&player),
            Some(payload),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn coach_needs_delegated_team_access_to_record() {
        let users = Arc::new(FakeUserService::new());
        users.grant_membership(5, 3);
        let state = test_state(migrated_db_path(), users);
        let admin = token_for(1, "admin");
        let coach = token_for(5, "coach");
        let test_id = seed_catalog_test(app(state.clone()), &admin, "Bench Press").await;

        let granted = send(
            app(state.clone()),
            "POST",
            "/v1/test-results",
            Some(&coach),
            Some(result_payload(test_id, 7, "2026-05-01", 100.0)),
        )
        .await;
        assert_eq!(granted.status(), StatusCode::CREATED);

        let mut denied_payload = result_payload(test_id, 7, "2026-05-02", 104.0);
        denied_payload["team_id"] = json!(9);
        let denied = send(
            app(state),
            "POST",
            "/v1/test-results",
            Some(&coach),
            Some(denied_payload),
        )
        .await;
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn delegate_outage_fails_closed_with_server_error() {
        let users = Arc::new(FakeUserService::new());
        users.set_failing(true);
        let state = test_state(migrated_db_path(), Arc::clone(&users));
        let admin = token_for(1, "admin");
        users.set_failing(false);
        let test_id = seed_catalog_test(app(state.clone()), &admin, "Bench Press").await;
        users.set_failing(true);

        let coach = token_for(5, "coach");
        let response = send(
            app(state),
            "POST",
            "/v1/test-results",
            Some(&coach),
            Some(result_payload(test_id, 7, "2026-05-01", 100.0)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn unknown_payload_fields_are_rejected() {
        let state = test_state(migrated_db_path(), Arc::new(FakeUserService::new()));
        let admin = token_for(1, "admin");
        let player = token_for(7, "player");
        let test_id = seed_catalog_test(app(state.clone()), &admin, "Bench Press").await;

        let mut payload = result_payload(test_id, 7, "2026-05-01", 100.0);
        payload["comparison_to_previous"] = json!(42.0);
        let response = send(
            app(state.clone()),
            "POST",
            "/v1/test-results",
            Some(&player),
            Some(payload),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let created = send(
            app(state.clone()),
            "POST",
            "/v1/test-results",
            Some(&player),
            Some(result_payload(test_id, 7, "2026-05-01", 100.0)),
        )
        .await;
        let created = response_json(created).await;
        let id = created
            .get("data")
            .and_then(|data| data.get("id"))
            .and_then(serde_json::Value::as_i64)
            .unwrap_or_default();

        let response = send(
            app(state),
            "PUT",
            &format!("/v1/test-results/{id}"),
            Some(&player),
            Some(json!({ "result": 105.0, "created_by": 99 })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn update_recomputes_the_change() {
        let users = Arc::new(FakeUserService::new());
        let state = test_state(migrated_db_path(), Arc::clone(&users));
        let admin = token_for(1, "admin");
        let player = token_for(7, "player");
        let test_id = seed_catalog_test(app(state.clone()), &admin, "Bench Press").await;

        send(
            app(state.clone()),
            "POST",
            "/v1/test-results",
            Some(&player),
            Some(result_payload(test_id, 7, "2026-05-01", 100.0)),
        )
        .await;
        let second = send(
            app(state.clone()),
            "POST",
            "/v1/test-results",
            Some(&player),
            Some(result_payload(test_id, 7, "2026-05-08", 110.0)),
        )
        .await;
        let second = response_json(second).await;
        let id = second
            .get("data")
            .and_then(|data| data.get("id"))
            .and_then(serde_json::Value::as_i64)
            .unwrap_or_default();

        let response = send(
            app(state),
            "PUT",
            &format!("/v1/test-results/{id}"),
            Some(&player),
            Some(json!({ "result": 120.0 })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(
            value.get("message").and_then(serde_json::Value::as_str),
            Some("Test result updated")
        );
        assert_eq!(
            value
                .get("data")
                .and_then(|data| data.get("comparison_to_previous"))
                .and_then(serde_json::Value::as_f64),
            Some(9.09)
        );
    }

    #[tokio::test]
    async fn delete_is_not_idempotent() {
        let state = test_state(migrated_db_path(), Arc::new(FakeUserService::new()));
        let admin = token_for(1, "admin");
        let player = token_for(7, "player");
        let test_id = seed_catalog_test(app(state.clone()), &admin, "Bench Press").await;

        let created = send(
            app(state.clone()),
            "POST",
            "/v1/test-results",
            Some(&player),
            Some(result_payload(test_id, 7, "2026-05-01", 100.0)),
        )
        .await;
        let created = response_json(created).await;
        let id = created
            .get("data")
            .and_then(|data| data.get("id"))
            .and_then(serde_json::Value::as_i64)
            .unwrap_or_default();

        let first = send(
            app(state.clone()),
            "DELETE",
            &format!("/v1/test-results/{id}"),
            Some(&player),
            None,
        )
        .await;
        assert_eq!(first.status(), StatusCode::OK);

        let second = send(
            app(state),
            "DELETE",
            &format!("/v1/test-results/{id}"),
            Some(&player),
            None,
        )
        .await;
        assert_eq!(second.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn subject_cannot_delete_a_coach_recorded_result() {
        let users = Arc::new(FakeUserService::new());
        users.grant_membership(5, 3);
        let state = test_state(migrated_db_path(), users);
        let admin = token_for(1, "admin");
        let coach = token_for(5, "coach");
        let player = token_for(7, "player");
        let test_id = seed_catalog_test(app(state.clone()), &admin, "Bench Press").await;

        let created = send(
            app(state.clone()),
            "POST",
            "/v1/test-results",
            Some(&coach),
            Some(result_payload(test_id, 7, "2026-05-01", 100.0)),
        )
        .await;
        let created = response_json(created).await;
        let id = created
            .get("data")
            .and_then(|data| data.get("id"))
            .and_then(serde_json::Value::as_i64)
            .unwrap_or_default();

        let response = send(
            app(state),
            "DELETE",
            &format!("/v1/test-results/{id}"),
            Some(&player),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn show_resolves_the_test_name() {
        let state = test_state(migrated_db_path(), Arc::new(FakeUserService::new()));
        let admin = token_for(1, "admin");
        let player = token_for(7, "player");
        let test_id = seed_catalog_test(app(state.clone()), &admin, "Bench Press").await;

        let created = send(
            app(state.clone()),
            "POST",
            "/v1/test-results",
            Some(&player),
            Some(result_payload(test_id, 7, "2026-05-01", 100.0)),
        )
        .await;
        let created = response_json(created).await;
        assert!(created
            .get("data")
            .and_then(|data| data.get("test_name"))
            .is_none());
        let id = created
            .get("data")
            .and_then(|data| data.get("id"))
            .and_then(serde_json::Value::as_i64)
            .unwrap_or_default();

        let response = send(
            app(state),
            "GET",
            &format!("/v1/test-results/{id}"),
            Some(&player),
            None,
        )
        .await;
        let value = response_json(response).await;
        assert_eq!(
            value
                .get("data")
                .and_then(|data| data.get("test_name"))
                .and_then(serde_json::Value::as_str),
            Some("Bench Press")
        );
    }

    #[tokio::test]
    async fn history_returns_earliest_results_and_caps_the_limit() {
        let state = test_state(migrated_db_path(), Arc::new(FakeUserService::new()));
        let admin = token_for(1, "admin");
        let player = token_for(7, "player");
        let test_id = seed_catalog_test(app(state.clone()), &admin, "Bench Press").await;

        for (date, value) in [
            ("2026-05-15", 99.0),
            ("2026-05-01", 100.0),
            ("2026-05-08", 110.0),
        ] {
            send(
                app(state.clone()),
                "POST",
                "/v1/test-results",
                Some(&player),
                Some(result_payload(test_id, 7, date, value)),
            )
            .await;
        }

        let response = send(
            app(state.clone()),
            "GET",
            &format!("/v1/test-results/user/7/test/{test_id}?limit=2"),
            Some(&player),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(
            value.get("count").and_then(serde_json::Value::as_u64),
            Some(2)
        );
        let dates: Vec<&str> = value
            .get("data")
            .and_then(serde_json::Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        row.get("test_date").and_then(serde_json::Value::as_str)
                    })
                    .collect()
            })
            .unwrap_or_default();
        assert_eq!(dates, vec!["2026-05-01", "2026-05-08"]);

        let oversized = send(
            app(state),
            "GET",
            &format!("/v1/test-results/user/7/test/{test_id}?limit=500"),
            Some(&player),
            None,
        )
        .await;
        assert_eq!(oversized.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn coach_reads_history_through_the_subjects_teams() {
        let users = Arc::new(FakeUserService::new());
        users.seed_profile(UserProfile {
            id: 7,
            teams: vec![TeamMembership {
                id: 3,
                name: "U18".to_string(),
            }],
        });
        users.grant_membership(5, 3);
        let state = test_state(migrated_db_path(), users);
        let admin = token_for(1, "admin");
        let coach = token_for(5, "coach");
        let outsider = token_for(6, "coach");
        let test_id = seed_catalog_test(app(state.clone()), &admin, "Bench Press").await;

        let granted = send(
            app(state.clone()),
            "GET",
            &format!("/v1/test-results/user/7/test/{test_id}"),
            Some(&coach),
            None,
        )
        .await;
        assert_eq!(granted.status(), StatusCode::OK);

        let denied = send(
            app(state),
            "GET",
            &format!("/v1/test-results/user/7/test/{test_id}"),
            Some(&outsider),
            None,
        )
        .await;
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn team_stats_rank_members_and_honor_the_as_of_date() {
        let users = Arc::new(FakeUserService::new());
        users.grant_membership(7, 3);
        let state = test_state(migrated_db_path(), users);
        let admin = token_for(1, "admin");
        let seven = token_for(7, "player");
        let eight = token_for(8, "player");
        let test_id = seed_catalog_test(app(state.clone()), &admin, "Bench Press").await;

        for (token, user_id, date, value) in [
            (&seven, 7, "2026-05-01", 100.0),
            (&seven, 7, "2026-06-20", 110.0),
            (&eight, 8, "2026-05-05", 130.0),
        ] {
            send(
                app(state.clone()),
                "POST",
                "/v1/test-results",
                Some(token),
                Some(result_payload(test_id, user_id, date, value)),
            )
            .await;
        }

        let response = send(
            app(state.clone()),
            "GET",
            &format!("/v1/test-results/team/3/test/{test_id}"),
            Some(&seven),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        let users_in_order: Vec<i64> = value
            .get("data")
            .and_then(serde_json::Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get("user_id").and_then(serde_json::Value::as_i64))
                    .collect()
            })
            .unwrap_or_default();
        assert_eq!(users_in_order, vec![8, 7]);

        let as_of = send(
            app(state),
            "GET",
            &format!("/v1/test-results/team/3/test/{test_id}?date=2026-05-03"),
            Some(&admin),
            None,
        )
        .await;
        let as_of = response_json(as_of).await;
        let seven_row = as_of
            .get("data")
            .and_then(serde_json::Value::as_array)
            .and_then(|rows| {
                rows.iter().find(|row| {
                    row.get("user_id").and_then(serde_json::Value::as_i64) == Some(7)
                })
            })
            .cloned();
        assert_eq!(
            seven_row
                .as_ref()
                .and_then(|row| row.get("result"))
                .and_then(serde_json::Value::as_f64),
            Some(100.0)
        );
    }

    #[tokio::test]
    async fn team_stats_require_membership_for_non_staff() {
        let state = test_state(migrated_db_path(), Arc::new(FakeUserService::new()));
        let outsider = token_for(9, "player");

        let response = send(
            app(state),
            "GET",
            "/v1/test-results/team/3/test/1",
            Some(&outsider),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn catalog_writes_are_staff_only_and_deletes_admin_only() {
        let state = test_state(migrated_db_path(), Arc::new(FakeUserService::new()));
        let coach = token_for(5, "coach");
        let team_admin = token_for(2, "team_admin");

        let denied_create = send(
            app(state.clone()),
            "POST",
            "/v1/tests",
            Some(&coach),
            Some(json!({ "name": "Bench Press", "test_type": "strength", "unit": "kg" })),
        )
        .await;
        assert_eq!(denied_create.status(), StatusCode::FORBIDDEN);

        let test_id = seed_catalog_test(app(state.clone()), &team_admin, "Bench Press").await;

        let denied_delete = send(
            app(state),
            "DELETE",
            &format!("/v1/tests/{test_id}"),
            Some(&team_admin),
            None,
        )
        .await;
        assert_eq!(denied_delete.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn deleting_a_referenced_test_deactivates_it() {
        let state = test_state(migrated_db_path(), Arc::new(FakeUserService::new()));
        let admin = token_for(1, "admin");
        let player = token_for(7, "player");
        let test_id = seed_catalog_test(app(state.clone()), &admin, "Bench Press").await;

        send(
            app(state.clone()),
            "POST",
            "/v1/test-results",
            Some(&player),
            Some(result_payload(test_id, 7, "2026-05-01", 100.0)),
        )
        .await;

        let response = send(
            app(state.clone()),
            "DELETE",
            &format!("/v1/tests/{test_id}"),
            Some(&admin),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(
            value.get("message").and_then(serde_json::Value::as_str),
            Some("Test deactivated; stored results still reference it")
        );

        let listed = send(app(state), "GET", "/v1/tests", Some(&admin), None).await;
        let listed = response_json(listed).await;
        assert_eq!(
            listed.get("count").and_then(serde_json::Value::as_u64),
            Some(0)
        );
    }

    #[tokio::test]
    async fn inactive_catalog_entries_are_admin_only() {
        let state = test_state(migrated_db_path(), Arc::new(FakeUserService::new()));
        let admin = token_for(1, "admin");
        let player = token_for(7, "player");
        let test_id = seed_catalog_test(app(state.clone()), &admin, "Bench Press").await;

        send(
            app(state.clone()),
            "POST",
            "/v1/test-results",
            Some(&player),
            Some(result_payload(test_id, 7, "2026-05-01", 100.0)),
        )
        .await;
        send(
            app(state.clone()),
            "DELETE",
            &format!("/v1/tests/{test_id}"),
            Some(&admin),
            None,
        )
        .await;

        let listed = send(
            app(state.clone()),
            "GET",
            "/v1/tests?include_inactive=true",
            Some(&player),
            None,
        )
        .await;
        let listed = response_json(listed).await;
        assert_eq!(
            listed.get("count").and_then(serde_json::Value::as_u64),
            Some(0)
        );

        let shown = send(
            app(state.clone()),
            "GET",
            &format!("/v1/tests/{test_id}"),
            Some(&player),
            None,
        )
        .await;
        assert_eq!(shown.status(), StatusCode::FORBIDDEN);

        let admin_listed = send(
            app(state.clone()),
            "GET",
            "/v1/tests?include_inactive=true",
            Some(&admin),
            None,
        )
        .await;
        let admin_listed = response_json(admin_listed).await;
        assert_eq!(
            admin_listed.get("count").and_then(serde_json::Value::as_u64),
            Some(1)
        );

        let admin_shown = send(
            app(state),
            "GET",
            &format!("/v1/tests/{test_id}"),
            Some(&admin),
            None,
        )
        .await;
        assert_eq!(admin_shown.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn duplicate_catalog_names_conflict() {
        let state = test_state(migrated_db_path(), Arc::new(FakeUserService::new()));
        let admin = token_for(1, "admin");
        seed_catalog_test(app(state.clone()), &admin, "Bench Press").await;

        let response = send(
            app(state),
            "POST",
            "/v1/tests",
            Some(&admin),
            Some(json!({ "name": "Bench Press", "test_type": "strength", "unit": "kg" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_queue_drains_jobs_in_fifo_order() {
        let queue = SyncQueue::new(Duration::from_millis(100));
        let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

        for index in 0..3_u32 {
            let order = Arc::clone(&order);
            queue.enqueue(
                format!("job-{index}"),
                Box::pin(async move {
                    lock(&order).push(index);
                    Ok(())
                }),
            );
        }

        for _ in 0..200 {
            if lock(&order).len() == 3 && queue.depth() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*lock(&order), vec![0, 1, 2]);
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_queue_drops_failed_jobs_and_keeps_draining() {
        let queue = SyncQueue::new(Duration::from_millis(100));
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        {
            let order = Arc::clone(&order);
            queue.enqueue(
                "failing",
                Box::pin(async move {
                    lock(&order).push("failing");
                    Err(TrainingError::Delegate("push rejected".to_string()))
                }),
            );
        }
        {
            let order = Arc::clone(&order);
            queue.enqueue(
                "surviving",
                Box::pin(async move {
                    lock(&order).push("surviving");
                    Ok(())
                }),
            );
        }

        for _ in 0..200 {
            if lock(&order).len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*lock(&order), vec!["failing", "surviving"]);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_queue_accepts_jobs_while_draining() {
        let queue = SyncQueue::new(Duration::from_millis(100));
        let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

        {
            let order = Arc::clone(&order);
            let queue_handle = queue.clone();
            queue.enqueue(
                "first",
                Box::pin(async move {
                    lock(&order).push(1);
                    let order = Arc::clone(&order);
                    queue_handle.enqueue(
                        "second",
                        Box::pin(async move {
                            lock(&order).push(2);
                            Ok(())
                        }),
                    );
                    Ok(())
                }),
            );
        }

        for _ in 0..200 {
            if lock(&order).len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*lock(&order), vec![1, 2]);
    }

    #[tokio::test]
    async fn create_pushes_a_profile_snapshot_through_the_queue() {
        let users = Arc::new(FakeUserService::new());
        let state = test_state(migrated_db_path(), Arc::clone(&users));
        let admin = token_for(1, "admin");
        let player = token_for(7, "player");
        let test_id = seed_catalog_test(app(state.clone()), &admin, "Bench Press").await;

        let response = send(
            app(state),
            "POST",
            "/v1/test-results",
            Some(&player),
            Some(result_payload(test_id, 7, "2026-05-01", 100.0)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let mut pushes = Vec::new();
        for _ in 0..200 {
            pushes = users.pushes();
            if !pushes.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0, 7);
        assert_eq!(pushes[0].1.test_result.value, 100.0);
        assert_eq!(pushes[0].1.test_result.change, None);
        assert_eq!(pushes[0].1.test_result.date, "2026-05-01");
    }

    #[tokio::test]
    async fn failed_profile_push_never_fails_the_write() {
        let users = Arc::new(FakeUserService::new());
        let state = test_state(migrated_db_path(), Arc::clone(&users));
        let admin = token_for(1, "admin");
        let player = token_for(7, "player");
        let test_id = seed_catalog_test(app(state.clone()), &admin, "Bench Press").await;

        users.set_failing(true);
        let response = send(
            app(state.clone()),
            "POST",
            "/v1/test-results",
            Some(&player),
            Some(result_payload(test_id, 7, "2026-05-01", 100.0)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        // Give the failing job time to drain and be dropped before the
        // delegate recovers.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(users.pushes().is_empty());

        users.set_failing(false);
        let response = send(
            app(state),
            "POST",
            "/v1/test-results",
            Some(&player),
            Some(result_payload(test_id, 7, "2026-05-08", 110.0)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let mut pushes = Vec::new();
        for _ in 0..200 {
            pushes = users.pushes();
            if !pushes.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // The first push was dropped; only the second result reaches the
        // profile.
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].1.test_result.value, 110.0);
    }

    #[tokio::test]
    async fn player_listing_defaults_to_their_own_rows() {
        let state = test_state(migrated_db_path(), Arc::new(FakeUserService::new()));
        let admin = token_for(1, "admin");
        let seven = token_for(7, "player");
        let eight = token_for(8, "player");
        let test_id = seed_catalog_test(app(state.clone()), &admin, "Bench Press").await;

        send(
            app(state.clone()),
            "POST",
            "/v1/test-results",
            Some(&seven),
            Some(result_payload(test_id, 7, "2026-05-01", 100.0)),
        )
        .await;
        send(
            app(state.clone()),
            "POST",
            "/v1/test-results",
            Some(&eight),
            Some(result_payload(test_id, 8, "2026-05-01", 90.0)),
        )
        .await;

        let response = send(
            app(state.clone()),
            "GET",
            "/v1/test-results",
            Some(&seven),
            None,
        )
        .await;
        let value = response_json(response).await;
        assert_eq!(
            value.get("count").and_then(serde_json::Value::as_u64),
            Some(1)
        );

        let denied = send(
            app(state),
            "GET",
            "/v1/test-results?user_id=8",
            Some(&seven),
            None,
        )
        .await;
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    }
}
