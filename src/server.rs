use std::{convert::Infallible, net::SocketAddr, time::Duration};

use anyhow::{anyhow, Context};
use axum::{
    extract::{Path, Query, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, patch, post},
    Json, Router,
};
use chrono::Utc;
use futures::StreamExt;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    agent::{Agent, UsageSink},
    auth::{self, Claims},
    chat::LlmClient,
    checkpoint::Checkpoints,
    conf::{self, ConfJwt},
    data::{self, RateLimit, Storage},
    docs::ApiDoc,
    types::{
        LoginReq, MessageReq, PasswordChangeReq, PlanAssignReq,
        PlanCreateReq, PlanRead, PlanUpdateReq, ProfileRead,
        ProfileUpdateReq, RateLimited, RegisterReq, TokenResponse,
        UsageLogRead, UsageStatus, UsageTotalsRead, UserRead, UserUpdateReq,
    },
};

pub const MAX_MESSAGE_CHARS: usize = 2000;

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug)]
pub struct ApiError(StatusCode, Json<ErrorResponse>);

impl From<StatusCode> for ApiError {
    fn from(status: StatusCode) -> Self {
        ApiError(
            status,
            Json(ErrorResponse {
                error: status
                    .canonical_reason()
                    .unwrap_or("Unknown error")
                    .to_string(),
                details: None,
            }),
        )
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError(status, body) = self;
        (status, body).into_response()
    }
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    ApiError(
        status,
        Json(ErrorResponse {
            error: message.into(),
            details: None,
        }),
    )
}

fn internal_error(error: anyhow::Error) -> ApiError {
    tracing::error!(?error, "Internal error.");
    StatusCode::INTERNAL_SERVER_ERROR.into()
}

#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    error: String,
    details: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub agent: Agent,
    pub jwt: ConfJwt,
    pub token_ttl: Duration,
    pub bcrypt_cost: u32,
}

#[tracing::instrument(name = "server", skip_all)]
pub async fn run() -> anyhow::Result<()> {
    let conf = conf::global();
    tracing::info!(?conf, "Starting.");
    let addr = SocketAddr::from((conf.addr, conf.port));

    let storage = Storage::connect().await?;
    let checkpoints = Checkpoints::new(&storage);
    let llm = LlmClient::new(&conf.llm)
        .map_err(|error| anyhow!("Failed to construct LLM client: {error}"))?;
    let usage = UsageSink::spawn(storage.clone(), conf.usage_queue_capacity);
    let agent =
        Agent::new(llm, checkpoints, usage, conf.llm.system_prompt.clone());
    let state = AppState {
        storage,
        agent,
        jwt: conf.jwt.clone(),
        token_ttl: Duration::from_secs_f32(conf.access_token_ttl),
        bcrypt_cost: conf.bcrypt_cost,
    };

    let service = router(state).into_make_service();

    match &conf.tls {
        None => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::warn!(?addr, "Listening unencrypted.");
            axum::serve(listener, service).await?;
        }
        Some(conf::Tls {
            cert_file,
            key_file,
        }) => {
            // XXX One MUST do this manual init of rustls provider when using
            //     more than a single dep which itself depends on rustls.
            //     Here we using 2:
            //     - axum_server
            //     - reqwest
            rustls::crypto::aws_lc_rs::default_provider()
                .install_default()
                .map_err(|crypto_provider| {
                    anyhow!(
                        "Failed to install default crypto provider: \
                        {crypto_provider:?}"
                    )
                })?;

            let config =
                axum_server::tls_rustls::RustlsConfig::from_pem_file(
                    cert_file, key_file,
                )
                .await
                .context(format!(
                    "Failed to construct RustlsConfig. \
                    cert_file={cert_file:?}, key_file={key_file:?}"
                ))?;

            tracing::info!(
                ?addr,
                ?cert_file,
                ?key_file,
                "Listening with TLS."
            );
            axum_server::bind_rustls(addr, config)
                .serve(service)
                .await?;
        }
    }

    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin([
            "http://localhost:3000".parse().unwrap(),
            "https://localhost:3000".parse().unwrap(),
        ])
        .allow_methods([Method::GET, Method::POST, Method::PATCH])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
        ]);

    let public = Router::new()
        .route("/auth/register", post(handle_register))
        .route("/auth/login", post(handle_login));

    let protected = Router::new()
        .route("/auth/refresh", post(handle_refresh))
        .route("/users/me", get(handle_me).patch(handle_me_update))
        .route("/users/me/change-password", post(handle_change_password))
        .route("/users/:id/plan", post(handle_assign_plan))
        .route(
            "/profiles/me",
            get(handle_profile).patch(handle_profile_update),
        )
        .route("/plans", get(handle_plans).post(handle_plan_create))
        .route("/plans/:id", patch(handle_plan_update))
        .route("/chatbot", post(handle_chat))
        .route("/chatbot/stream", post(handle_chat_stream))
        .route("/chatbot/usage", get(handle_usage))
        .route("/chatbot/usage/logs", get(handle_usage_logs))
        .route("/chatbot/usage/totals", get(handle_usage_totals))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_layer,
        ));

    Router::new()
        .route("/health", get(health_check))
        .merge(
            SwaggerUi::new("/swagger-ui")
                .url("/api-docs/openapi.json", ApiDoc::openapi()),
        )
        .merge(public)
        .merge(protected)
        .layer(middleware::from_fn({
            |req, next: Next| REQ_ID.scope(ReqId::new(), next.run(req))
        }))
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

#[derive(Debug, Clone)]
struct ReqId {
    pub req_id: String,
}

impl ReqId {
    fn new() -> Self {
        let req_id = cuid2::create_id();
        Self { req_id }
    }
}

tokio::task_local! {
    pub static USER: data::User;
    static REQ_ID: ReqId;
}

async fn auth_layer(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_token = req
        .headers()
        .get(header::AUTHORIZATION)
        .ok_or_else(|| {
            tracing::warn!("Missing Authorization header");
            ApiError::from(StatusCode::UNAUTHORIZED)
        })?
        .to_str()
        .map_err(|error| {
            tracing::warn!(?error, "Invalid Authorization header encoding");
            ApiError::from(StatusCode::UNAUTHORIZED)
        })?
        .strip_prefix("Bearer ")
        .ok_or_else(|| {
            tracing::warn!("Authorization header missing 'Bearer ' prefix");
            ApiError::from(StatusCode::UNAUTHORIZED)
        })?;

    let claims =
        Claims::from_str(auth_token, &state.jwt).map_err(|error| {
            tracing::warn!(?error, "JWT validation failed");
            ApiError::from(StatusCode::UNAUTHORIZED)
        })?;

    let user = state
        .storage
        .user_by_email(&claims.sub)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| {
            tracing::warn!(sub = ?claims.sub, "Token subject has no account");
            ApiError::from(StatusCode::UNAUTHORIZED)
        })?;

    if !user.is_active {
        return Err(api_error(StatusCode::FORBIDDEN, "Inactive user"));
    }

    Ok(USER.scope(user, next.run(req)).await)
}

fn issue_token(
    state: &AppState,
    user: &data::User,
) -> Result<TokenResponse, ApiError> {
    let claims = Claims::new(&user.email, state.token_ttl, &state.jwt)
        .map_err(|error| internal_error(error.into()))?;
    let token = claims
        .to_str(&state.jwt)
        .map_err(|error| internal_error(error.into()))?;
    Ok(TokenResponse::bearer(token))
}

#[tracing::instrument(skip_all, fields(req_id = REQ_ID.get().req_id))]
#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = RegisterReq,
    responses(
        (status = 201, description = "User created", body = UserRead),
        (status = 400, description = "Email or username already taken"),
    )
)]
pub async fn handle_register(
    State(state): State<AppState>,
    Json(body): Json<RegisterReq>,
) -> Result<(StatusCode, Json<UserRead>), ApiError> {
    if state
        .storage
        .user_by_email(&body.email)
        .await
        .map_err(internal_error)?
        .is_some()
    {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Email already registered",
        ));
    }
    if state
        .storage
        .user_by_username(&body.username)
        .await
        .map_err(internal_error)?
        .is_some()
    {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Username already taken",
        ));
    }
    let password_hash = auth::hash_password(&body.password, state.bcrypt_cost)
        .map_err(internal_error)?;
    let user = state
        .storage
        .create_user(data::NewUser {
            username: &body.username,
            email: &body.email,
            password_hash,
            first_name: body.first_name,
            last_name: body.last_name,
        })
        .await
        .map_err(internal_error)?;
    tracing::info!(user_id = user.id, "User registered.");
    Ok((StatusCode::CREATED, Json(user.into())))
}

#[tracing::instrument(skip_all, fields(req_id = REQ_ID.get().req_id))]
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginReq,
    responses(
        (status = 200, description = "Token issued", body = TokenResponse),
        (status = 401, description = "Bad credentials or inactive account"),
    )
)]
pub async fn handle_login(
    State(state): State<AppState>,
    Json(body): Json<LoginReq>,
) -> Result<Json<TokenResponse>, ApiError> {
    let user = state
        .storage
        .authenticate(&body.email, &body.password)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| {
            tracing::warn!(email = ?body.email, "Authentication failed.");
            api_error(
                StatusCode::UNAUTHORIZED,
                "Incorrect email or password",
            )
        })?;
    tracing::info!(user_id = user.id, "User authenticated.");
    Ok(Json(issue_token(&state, &user)?))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = REQ_ID.get().req_id, uid = USER.get().id)
)]
#[utoipa::path(
    post,
    path = "/auth/refresh",
    responses(
        (status = 200, description = "Fresh token", body = TokenResponse),
        (status = 401, description = "Missing or invalid JWT"),
    ),
    security(("jwt" = []))
)]
pub async fn handle_refresh(
    State(state): State<AppState>,
) -> Result<Json<TokenResponse>, ApiError> {
    let user = USER.get();
    Ok(Json(issue_token(&state, &user)?))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = REQ_ID.get().req_id, uid = USER.get().id)
)]
#[utoipa::path(
    get,
    path = "/users/me",
    responses((status = 200, description = "Current user", body = UserRead)),
    security(("jwt" = []))
)]
pub async fn handle_me() -> Json<UserRead> {
    Json(USER.get().into())
}

#[tracing::instrument(
    skip_all,
    fields(req_id = REQ_ID.get().req_id, uid = USER.get().id)
)]
#[utoipa::path(
    patch,
    path = "/users/me",
    request_body = UserUpdateReq,
    responses(
        (status = 200, description = "Updated user", body = UserRead),
        (status = 403, description = "Sensitive field for non-superuser"),
    ),
    security(("jwt" = []))
)]
pub async fn handle_me_update(
    State(state): State<AppState>,
    Json(body): Json<UserUpdateReq>,
) -> Result<Json<UserRead>, ApiError> {
    let user = USER.get();
    if body.is_active.is_some() && !user.is_superuser {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "Cannot modify is_active field",
        ));
    }
    let updated = state
        .storage
        .update_user(user.id, body.into())
        .await
        .map_err(internal_error)?
        .ok_or_else(|| ApiError::from(StatusCode::NOT_FOUND))?;
    Ok(Json(updated.into()))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = REQ_ID.get().req_id, uid = USER.get().id)
)]
#[utoipa::path(
    post,
    path = "/users/me/change-password",
    request_body = PasswordChangeReq,
    responses(
        (status = 200, description = "Password changed"),
        (status = 400, description = "Current password is incorrect"),
    ),
    security(("jwt" = []))
)]
pub async fn handle_change_password(
    State(state): State<AppState>,
    Json(body): Json<PasswordChangeReq>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = USER.get();
    if !auth::verify_password(&body.current_password, &user.password) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Current password is incorrect",
        ));
    }
    let password_hash =
        auth::hash_password(&body.new_password, state.bcrypt_cost)
            .map_err(internal_error)?;
    state
        .storage
        .set_password(user.id, &password_hash)
        .await
        .map_err(internal_error)?;
    Ok(Json(
        serde_json::json!({"message": "Password changed successfully"}),
    ))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = REQ_ID.get().req_id, uid = USER.get().id)
)]
#[utoipa::path(
    post,
    path = "/users/{id}/plan",
    params(
        ("id" = i64, Path, description = "User to move to the plan")
    ),
    request_body = PlanAssignReq,
    responses(
        (status = 200, description = "Plan assigned", body = UserRead),
        (status = 403, description = "Not a superuser"),
        (status = 404, description = "User or plan not found"),
    ),
    security(("jwt" = []))
)]
pub async fn handle_assign_plan(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Json(body): Json<PlanAssignReq>,
) -> Result<Json<UserRead>, ApiError> {
    let caller = USER.get();
    if !caller.is_superuser {
        tracing::warn!(uid = caller.id, "Non-superuser plan change attempt.");
        return Err(StatusCode::FORBIDDEN.into());
    }
    let updated = state
        .storage
        .set_user_plan(user_id, body.plan_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| {
            api_error(StatusCode::NOT_FOUND, "User or plan not found")
        })?;
    Ok(Json(updated.into()))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = REQ_ID.get().req_id, uid = USER.get().id)
)]
#[utoipa::path(
    get,
    path = "/profiles/me",
    responses((status = 200, description = "Profile", body = ProfileRead)),
    security(("jwt" = []))
)]
pub async fn handle_profile(
    State(state): State<AppState>,
) -> Result<Json<ProfileRead>, ApiError> {
    let user = USER.get();
    let profile = state
        .storage
        .profile_for_user(user.id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| ApiError::from(StatusCode::NOT_FOUND))?;
    Ok(Json(profile.into()))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = REQ_ID.get().req_id, uid = USER.get().id)
)]
#[utoipa::path(
    patch,
    path = "/profiles/me",
    request_body = ProfileUpdateReq,
    responses(
        (status = 200, description = "Updated profile", body = ProfileRead)
    ),
    security(("jwt" = []))
)]
pub async fn handle_profile_update(
    State(state): State<AppState>,
    Json(body): Json<ProfileUpdateReq>,
) -> Result<Json<ProfileRead>, ApiError> {
    let user = USER.get();
    let profile = state
        .storage
        .update_profile(user.id, body.into())
        .await
        .map_err(internal_error)?
        .ok_or_else(|| ApiError::from(StatusCode::NOT_FOUND))?;
    Ok(Json(profile.into()))
}

#[derive(serde::Deserialize, Debug)]
pub struct PlansQuery {
    #[serde(default)]
    include_inactive: bool,
}

#[tracing::instrument(
    skip_all,
    fields(req_id = REQ_ID.get().req_id, uid = USER.get().id)
)]
#[utoipa::path(
    get,
    path = "/plans",
    responses(
        (status = 200, description = "All plans", body = Vec<PlanRead>),
        (status = 403, description = "Not a superuser"),
    ),
    security(("jwt" = []))
)]
pub async fn handle_plans(
    State(state): State<AppState>,
    Query(query): Query<PlansQuery>,
) -> Result<Json<Vec<PlanRead>>, ApiError> {
    require_superuser()?;
    let plans = state
        .storage
        .plans(query.include_inactive)
        .await
        .map_err(internal_error)?;
    Ok(Json(plans.into_iter().map(PlanRead::from).collect()))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = REQ_ID.get().req_id, uid = USER.get().id)
)]
#[utoipa::path(
    post,
    path = "/plans",
    request_body = PlanCreateReq,
    responses(
        (status = 201, description = "Plan created", body = PlanRead),
        (status = 400, description = "Plan name already taken"),
        (status = 403, description = "Not a superuser"),
    ),
    security(("jwt" = []))
)]
pub async fn handle_plan_create(
    State(state): State<AppState>,
    Json(body): Json<PlanCreateReq>,
) -> Result<(StatusCode, Json<PlanRead>), ApiError> {
    require_superuser()?;
    if state
        .storage
        .plan_by_name(&body.name)
        .await
        .map_err(internal_error)?
        .is_some()
    {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Plan name already taken",
        ));
    }
    let plan = state
        .storage
        .create_plan(data::NewPlan {
            name: &body.name,
            description: body.description,
            query_limit: body.query_limit,
            query_window_hours: body.query_window_hours,
            is_active: body.is_active.unwrap_or(true),
        })
        .await
        .map_err(internal_error)?;
    Ok((StatusCode::CREATED, Json(plan.into())))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = REQ_ID.get().req_id, uid = USER.get().id)
)]
#[utoipa::path(
    patch,
    path = "/plans/{id}",
    params(
        ("id" = i64, Path, description = "Plan to update")
    ),
    request_body = PlanUpdateReq,
    responses(
        (status = 200, description = "Updated plan", body = PlanRead),
        (status = 403, description = "Not a superuser"),
        (status = 404, description = "No such plan"),
    ),
    security(("jwt" = []))
)]
pub async fn handle_plan_update(
    State(state): State<AppState>,
    Path(plan_id): Path<i64>,
    Json(body): Json<PlanUpdateReq>,
) -> Result<Json<PlanRead>, ApiError> {
    require_superuser()?;
    let plan = state
        .storage
        .update_plan(plan_id, body.into())
        .await
        .map_err(internal_error)?
        .ok_or_else(|| ApiError::from(StatusCode::NOT_FOUND))?;
    Ok(Json(plan.into()))
}

fn require_superuser() -> Result<(), ApiError> {
    let user = USER.get();
    if !user.is_superuser {
        tracing::warn!(uid = user.id, "Superuser endpoint denied.");
        return Err(StatusCode::FORBIDDEN.into());
    }
    Ok(())
}

#[tracing::instrument(
    skip_all,
    fields(req_id = REQ_ID.get().req_id, uid = USER.get().id)
)]
#[utoipa::path(
    post,
    path = "/chatbot",
    request_body = MessageReq,
    responses(
        (status = 200, description = "Assistant reply", content_type = "text/plain"),
        (status = 400, description = "Empty or oversized message"),
        (status = 401, description = "Missing or invalid JWT"),
        (status = 429, description = "Query quota exhausted", body = RateLimited),
    ),
    security(("jwt" = []))
)]
pub async fn handle_chat(
    State(state): State<AppState>,
    Json(body): Json<MessageReq>,
) -> Result<Response, ApiError> {
    let user = USER.get();
    validate_message(&body.message)?;
    let check = state
        .storage
        .rate_limit_check(user.id, Utc::now())
        .await
        .map_err(internal_error)?;
    if !check.allowed {
        tracing::info!(uid = user.id, ?check, "Query rejected over quota.");
        return Ok(rate_limited(&check));
    }
    let thread_id = Checkpoints::thread_for_user(user.id);
    let main_call_id = format!("parent-{}", cuid2::create_id());
    let reply = state
        .agent
        .invoke(user.id, &thread_id, &main_call_id, &body.message)
        .await
        .map_err(internal_error)?;
    Ok(reply.into_response())
}

#[tracing::instrument(
    skip_all,
    fields(req_id = REQ_ID.get().req_id, uid = USER.get().id)
)]
#[utoipa::path(
    post,
    path = "/chatbot/stream",
    request_body = MessageReq,
    responses(
        (status = 200, description = "SSE fragment stream", content_type = "text/event-stream"),
        (status = 400, description = "Empty or oversized message"),
        (status = 401, description = "Missing or invalid JWT"),
        (status = 429, description = "Query quota exhausted", body = RateLimited),
    ),
    security(("jwt" = []))
)]
pub async fn handle_chat_stream(
    State(state): State<AppState>,
    Json(body): Json<MessageReq>,
) -> Result<Response, ApiError> {
    let user = USER.get();
    validate_message(&body.message)?;
    let check = state
        .storage
        .rate_limit_check(user.id, Utc::now())
        .await
        .map_err(internal_error)?;
    if !check.allowed {
        tracing::info!(uid = user.id, ?check, "Stream rejected over quota.");
        return Ok(rate_limited(&check));
    }
    let thread_id = Checkpoints::thread_for_user(user.id);
    let main_call_id = format!("parent-{}", cuid2::create_id());
    let fragments =
        state
            .agent
            .stream(user.id, thread_id, main_call_id, body.message);
    let events = fragments.map(|fragment| {
        Ok::<Event, Infallible>(Event::default().data(fragment))
    });
    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}

#[tracing::instrument(
    skip_all,
    fields(req_id = REQ_ID.get().req_id, uid = USER.get().id)
)]
#[utoipa::path(
    get,
    path = "/chatbot/usage",
    responses(
        (status = 200, description = "Current quota window", body = UsageStatus)
    ),
    security(("jwt" = []))
)]
pub async fn handle_usage(
    State(state): State<AppState>,
) -> Result<Json<UsageStatus>, ApiError> {
    let user = USER.get();
    let check = state
        .storage
        .rate_limit_check(user.id, Utc::now())
        .await
        .map_err(internal_error)?;
    Ok(Json(check.into()))
}

#[derive(serde::Deserialize, Debug)]
pub struct UsageLogsQuery {
    model: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[tracing::instrument(
    skip_all,
    fields(req_id = REQ_ID.get().req_id, uid = USER.get().id)
)]
#[utoipa::path(
    get,
    path = "/chatbot/usage/logs",
    responses(
        (status = 200, description = "Ledger entries, newest first", body = Vec<UsageLogRead>)
    ),
    security(("jwt" = []))
)]
pub async fn handle_usage_logs(
    State(state): State<AppState>,
    Query(query): Query<UsageLogsQuery>,
) -> Result<Json<Vec<UsageLogRead>>, ApiError> {
    let user = USER.get();
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0).max(0);
    let entries = state
        .storage
        .usage_entries(user.id, query.model.as_deref(), limit, offset)
        .await
        .map_err(internal_error)?;
    Ok(Json(entries.into_iter().map(UsageLogRead::from).collect()))
}

#[derive(serde::Deserialize, Debug)]
pub struct UsageTotalsQuery {
    model: Option<String>,
}

#[tracing::instrument(
    skip_all,
    fields(req_id = REQ_ID.get().req_id, uid = USER.get().id)
)]
#[utoipa::path(
    get,
    path = "/chatbot/usage/totals",
    responses(
        (status = 200, description = "Summed token usage", body = UsageTotalsRead)
    ),
    security(("jwt" = []))
)]
pub async fn handle_usage_totals(
    State(state): State<AppState>,
    Query(query): Query<UsageTotalsQuery>,
) -> Result<Json<UsageTotalsRead>, ApiError> {
    let user = USER.get();
    let totals = state
        .storage
        .usage_totals(user.id, query.model.as_deref())
        .await
        .map_err(internal_error)?;
    Ok(Json(totals.into()))
}

fn validate_message(message: &str) -> Result<(), ApiError> {
    let len = message.chars().count();
    if len == 0 || len > MAX_MESSAGE_CHARS {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("Message must be 1 to {MAX_MESSAGE_CHARS} characters"),
        ));
    }
    Ok(())
}

fn rate_limited(check: &RateLimit) -> Response {
    let payload = RateLimited {
        message: format!(
            "Rate limit exceeded. You have used {} of {} queries \
            in the last {} hours.",
            check.used, check.limit, check.window_hours
        ),
        queries_used: check.used,
        queries_limit: check.limit,
        window_hours: check.window_hours,
        queries_remaining: check.remaining,
    };
    let mut response =
        (StatusCode::TOO_MANY_REQUESTS, Json(payload)).into_response();
    let headers = response.headers_mut();
    headers.insert("X-RateLimit-Limit", HeaderValue::from(check.limit));
    headers
        .insert("X-RateLimit-Remaining", HeaderValue::from(check.remaining));
    headers
        .insert("X-RateLimit-Reset", HeaderValue::from(check.window_hours));
    response
}

#[cfg(test)]
mod tests;
