//! HTTP edge: request/response shapes, the uniform `{success, data?,
//! error?}` envelope, and router assembly. Grounded in the teacher's
//! `auth/api.rs` (a `State<...>` struct wrapping the service's components,
//! handlers returning `Result<Json<T>, E>` where `E: IntoResponse`) and the
//! router-assembly shape in `main.rs` (separate public/auth/admin
//! `Router::new()` instances, `.route_layer(from_fn_with_state(...))` for
//! the gated group, `.merge(...)` to combine, `CorsLayer` + request-logging
//! layered on top).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{FromRef, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::admin::{self, AdminQueries};
use crate::audit::AuditHandle;
use crate::auth::{AuthEngine, AuthError};
use crate::cache::Cache;
use crate::clock::Clock;
use crate::config::Config;
use crate::llm::LlmClient;
use crate::pipeline::{AnalysisOutcome, AnalysisPipeline};
use crate::price::PriceAggregator;
use crate::prompt::{AnalysisKind, ChartContext, ForexContext, PromptComposer};
use crate::store::{Store, Tier};

/// `(code, Arabic display name)`, authoritative and closed per the
/// documented forex catalog. The path segment carries no literal slash
/// (`EURUSD`, not `EUR/USD`) since a slash in a path segment is awkward to
/// route; the slash is reinserted only for display and prompt text.
pub const FOREX_PAIRS: &[(&str, &str)] = &[
    ("EURUSD", "اليورو/دولار"),
    ("GBPUSD", "الباوند/دولار"),
    ("USDJPY", "الدولار/ين"),
    ("AUDUSD", "الأسترالي/دولار"),
    ("USDCAD", "الدولار/كندي"),
    ("USDCHF", "الدولار/فرنك"),
    ("NZDUSD", "النيوزلندي/دولار"),
];

fn forex_name_ar(code: &str) -> Option<&'static str> {
    FOREX_PAIRS.iter().find(|(c, _)| *c == code).map(|(_, n)| *n)
}

fn display_pair(code: &str) -> String {
    if code.len() == 6 {
        format!("{}/{}", &code[..3], &code[3..])
    } else {
        code.to_string()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub cache: Arc<Cache>,
    pub clock: Arc<dyn Clock>,
    pub composer: Arc<PromptComposer>,
    pub llm: Arc<LlmClient>,
    pub audit: AuditHandle,
    pub config: Arc<Config>,
    pub gold: Arc<PriceAggregator>,
    pub forex: Arc<HashMap<String, Arc<PriceAggregator>>>,
}

impl FromRef<AppState> for Arc<Config> {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}

fn pipeline(state: &AppState) -> AnalysisPipeline<'_> {
    AnalysisPipeline::new(
        &state.store,
        state.clock.as_ref(),
        &state.cache,
        &state.composer,
        &state.llm,
        &state.audit,
        &state.config,
    )
}

/// HTTP-facing error taxonomy, per the response-envelope table: most
/// outcomes return `200` with `{success:false}` rather than a 4xx/5xx, so
/// `IntoResponse` only reaches for a non-200 status on validation failures,
/// unknown resources, missing dependencies and unhandled failures.
pub enum ApiError {
    Validation(String),
    UnknownResource(&'static str),
    /// The store (or another required dependency) could not be reached for
    /// this request — distinct from `Internal`, which is an unexpected
    /// programmer error. Maps to the 503 `"service-not-initialised"` row of
    /// the error-mapping table.
    ServiceUnavailable,
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::UnknownResource(msg) => (StatusCode::NOT_FOUND, msg.to_string()),
            ApiError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service-not-initialised".to_string(),
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "حدث خطأ داخلي في الخادم".to_string(),
            ),
        };
        (status, Json(json!({"success": false, "error": message}))).into_response()
    }
}

fn auth_error_envelope(err: AuthError) -> Json<Value> {
    Json(json!({"success": false, "error": err.message_ar()}))
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "api_running": true,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

fn format_gold_text(quote: &crate::price::PriceQuote) -> String {
    let change_emoji = if quote.change > 0.0 {
        "📈"
    } else if quote.change < 0.0 {
        "📉"
    } else {
        "➡️"
    };
    format!(
        "🏆 **سعر الذهب الحالي**\n\
         💰 السعر: **${:.2}** لكل أونصة\n\
         {change_emoji} التغيير: **{:+.2}** ({:+.2}%)\n\
         📊 أعلى 24 ساعة: ${:.2} | أدنى 24 ساعة: ${:.2}\n\
         📡 المصدر: {}",
        quote.price,
        quote.change,
        quote.change_pct,
        quote.high_24h,
        quote.low_24h,
        quote.source.to_uppercase(),
    )
}

fn format_forex_text(code: &str, name_ar: &str, quote: &crate::price::PriceQuote) -> String {
    let change_emoji = if quote.change >= 0.0 { "📈" } else { "📉" };
    format!(
        "💱 **{name_ar} ({})**\n\
         💰 السعر الحالي: {:.4}\n\
         {change_emoji} التغيير: {:+.4} ({:+.2}%)\n\
         📊 أعلى: {:.4} | أقل: {:.4}\n\
         🔄 المصدر: {}",
        display_pair(code),
        quote.price,
        quote.change,
        quote.change_pct,
        quote.high_24h,
        quote.low_24h,
        quote.source.to_uppercase(),
    )
}

async fn gold_price(State(state): State<AppState>) -> Json<Value> {
    let quote = state.gold.current(true).await;
    let formatted_text = format_gold_text(&quote);
    Json(json!({
        "success": true,
        "price_usd": quote.price,
        "price_change": quote.change,
        "price_change_pct": quote.change_pct,
        "ask": quote.ask,
        "bid": quote.bid,
        "high_24h": quote.high_24h,
        "low_24h": quote.low_24h,
        "source": quote.source,
        "formatted_text": formatted_text,
        "conversions": quote.gram_prices(),
    }))
}

async fn forex_price_handler(
    State(state): State<AppState>,
    Path(pair): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let code = pair.to_uppercase().replace('/', "");
    let agg = state
        .forex
        .get(&code)
        .ok_or(ApiError::UnknownResource("زوج العملة غير مدعوم"))?;
    let quote = agg.current(true).await;
    let name_ar = forex_name_ar(&code).unwrap_or(&code);
    let formatted_text = format_forex_text(&code, name_ar, &quote);

    Ok(Json(json!({
        "success": true,
        "pair": display_pair(&code),
        "price_usd": quote.price,
        "price_change": quote.change,
        "price_change_pct": quote.change_pct,
        "high_24h": quote.high_24h,
        "low_24h": quote.low_24h,
        "source": quote.source,
        "formatted_text": formatted_text,
    })))
}

async fn forex_pairs_handler() -> Json<Value> {
    let pairs: Vec<&str> = FOREX_PAIRS.iter().map(|(c, _)| *c).collect();
    let pair_names: HashMap<&str, &str> = FOREX_PAIRS.iter().copied().collect();
    Json(json!({"success": true, "pairs": pairs, "pair_names": pair_names}))
}

/// The five kinds' Arabic display catalog, supplementing each with the
/// short description the canonical source surface shows alongside the
/// name and icon.
async fn analysis_types() -> Json<Value> {
    let types: Vec<Value> = [
        (AnalysisKind::Quick, "تحليل مختصر وسريع للوضع الحالي"),
        (AnalysisKind::Detailed, "تحليل شامل ومفصل للسوق"),
        (AnalysisKind::Chart, "تحليل المخططات والمؤشرات الفنية"),
        (AnalysisKind::News, "تحليل تأثير الأخبار على السوق"),
        (AnalysisKind::Forecast, "توقعات مستقبلية للسوق"),
    ]
    .into_iter()
    .map(|(kind, description)| {
        json!({
            "id": kind.as_str(),
            "name": kind.display_name_ar(),
            "description": description,
            "icon": kind.icon(),
        })
    })
    .collect();
    Json(json!({"types": types}))
}

async fn api_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "success": true,
        "status": {
            "llm_configured": !state.config.llm_api_key.is_empty(),
            "gold_providers_configured": state.config.gold_api_ninjas_key.is_some()
                || state.config.metals_api_key.is_some(),
            "forex_providers_configured": state.config.forex_api_key.is_some(),
        },
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// The five fixed Arabic prompt suggestions the canonical source surface
/// shows in its quick-action bar.
async fn quick_questions() -> Json<Value> {
    Json(json!({
        "questions": [
            "تحليل الذهب الحالي",
            "ما هي توقعات الذهب للأسبوع القادم؟",
            "هل الوقت مناسب لشراء الذهب؟",
            "تحليل فني للذهب",
            "تأثير التضخم على أسعار الذهب",
        ]
    }))
}

fn outcome_envelope(outcome: AnalysisOutcome) -> Json<Value> {
    Json(match outcome {
        AnalysisOutcome::Denied { message, remaining, .. } => json!({
            "success": false,
            "error": message,
            "remaining_analyses": remaining,
        }),
        AnalysisOutcome::LlmFailure { message } => json!({
            "success": false,
            "error": message,
        }),
        AnalysisOutcome::Done { analysis, remaining, .. } => json!({
            "success": true,
            "analysis": analysis.content,
            "gold_price": analysis.price_snapshot.map(|p| json!({"price_usd": p})),
            "processing_time": analysis.processing_ms as f64 / 1000.0,
            "remaining_analyses": remaining,
        }),
    })
}

#[derive(Debug, Deserialize)]
struct AnalyzeRequest {
    analysis_type: String,
    user_question: Option<String>,
    additional_context: Option<String>,
    user_id: i64,
}

async fn analyze(
    State(state): State<AppState>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Json<Value>, ApiError> {
    let kind = AnalysisKind::parse(&req.analysis_type).ok_or_else(|| {
        ApiError::Validation(
            "نوع التحليل غير صحيح. الأنواع المتاحة: quick, detailed, chart, news, forecast"
                .to_string(),
        )
    })?;
    if kind == AnalysisKind::Chart {
        return Err(ApiError::Validation(
            "استخدم /analyze-chart لتحليل الشارت".to_string(),
        ));
    }

    let price = if kind == AnalysisKind::News {
        None
    } else {
        Some(state.gold.current(true).await)
    };
    let context = req.additional_context.or(req.user_question);

    let outcome = pipeline(&state)
        .analyze_gold(req.user_id, kind, price.as_ref(), context.as_deref())
        .await;
    Ok(outcome_envelope(outcome))
}

#[derive(Debug, Deserialize)]
struct AnalyzeForexRequest {
    pair: String,
    analysis_type: Option<String>,
    additional_context: Option<String>,
    user_id: i64,
}

async fn analyze_forex(
    State(state): State<AppState>,
    Json(req): Json<AnalyzeForexRequest>,
) -> Result<Json<Value>, ApiError> {
    let code = req.pair.to_uppercase().replace('/', "");
    let agg = state
        .forex
        .get(&code)
        .ok_or(ApiError::UnknownResource("زوج العملة غير مدعوم"))?;
    let quote = agg.current(true).await;
    let name_ar = forex_name_ar(&code).unwrap_or(&code).to_string();

    let ctx = ForexContext {
        pair: display_pair(&code),
        pair_name_ar: name_ar,
        quote,
        additional_context: req.additional_context.filter(|s| !s.is_empty()),
    };
    let kind = match req.analysis_type.as_deref() {
        Some("quick") => AnalysisKind::Quick,
        _ => AnalysisKind::Detailed,
    };

    let outcome = pipeline(&state).analyze_forex(req.user_id, kind, &ctx).await;
    Ok(outcome_envelope(outcome))
}

#[derive(Debug, Deserialize)]
struct AnalyzeChartRequest {
    image_data: String,
    analysis_notes: Option<String>,
    user_id: i64,
}

async fn analyze_chart(
    State(state): State<AppState>,
    Json(req): Json<AnalyzeChartRequest>,
) -> Result<Json<Value>, ApiError> {
    let raw = req
        .image_data
        .split_once(',')
        .map(|(_, data)| data)
        .unwrap_or(&req.image_data);
    let decoded_len = BASE64.decode(raw).map(|bytes| bytes.len()).unwrap_or(0);

    let ctx = ChartContext {
        width: 0,
        height: 0,
        format: "unknown".to_string(),
        size_kb: decoded_len as f64 / 1024.0,
        user_notes: req.analysis_notes.filter(|s| !s.is_empty()),
    };

    let outcome = pipeline(&state).analyze_chart(req.user_id, &ctx).await;
    Ok(outcome_envelope(outcome))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    email: String,
    password: String,
    display_name: Option<String>,
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Json<Value> {
    let engine = AuthEngine::new(&state.store, state.clock.as_ref());
    match engine.register(&req.email, &req.password, req.display_name) {
        Ok(projection) => Json(json!({"success": true, "user": projection})),
        Err(err) => auth_error_envelope(err),
    }
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> Json<Value> {
    let engine = AuthEngine::new(&state.store, state.clock.as_ref());
    match engine.login(&req.email, &req.password) {
        Ok(projection) => Json(json!({"success": true, "user": projection})),
        Err(err) => auth_error_envelope(err),
    }
}

async fn auth_user(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let user = state
        .store
        .find_user_by_id(user_id)
        .map_err(|_| ApiError::ServiceUnavailable)?
        .ok_or(ApiError::UnknownResource("المستخدم غير موجود"))?;
    Ok(Json(json!({"success": true, "user": user})))
}

async fn check_analysis_permission(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Json<Value> {
    let engine = AuthEngine::new(&state.store, state.clock.as_ref());
    let check = engine.can_analyze(user_id);
    Json(json!({
        "can_analyze": check.allowed,
        "message": if check.allowed { "مسموح بإجراء التحليل" } else { "غير مسموح بإجراء التحليل حالياً" },
        "remaining_analyses": check.remaining,
    }))
}

#[derive(Debug, Deserialize)]
struct AdminLoginRequest {
    username: String,
    password: String,
}

async fn admin_login(
    State(state): State<AppState>,
    Json(req): Json<AdminLoginRequest>,
) -> Json<Value> {
    if !admin::verify_admin_credentials(&state.config, &req.username, &req.password) {
        return Json(json!({"success": false, "error": "بيانات الدخول غير صحيحة"}));
    }
    let token = admin::issue_admin_token(&state.config.admin_token_secret, Utc::now());
    Json(json!({
        "success": true,
        "token": token,
        "expires_in": state.config.admin_token_ttl_secs,
    }))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<u32>,
    per_page: Option<u32>,
}

fn page_params(q: &PageQuery) -> (u32, u32) {
    (q.page.unwrap_or(1).max(1), q.per_page.unwrap_or(20).clamp(1, 200))
}

async fn admin_dashboard(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let dashboard = AdminQueries::new(&state.store)
        .dashboard()
        .map_err(|_| ApiError::ServiceUnavailable)?;
    Ok(Json(json!({"success": true, "dashboard": dashboard})))
}

async fn admin_list_users(
    State(state): State<AppState>,
    axum::extract::Query(q): axum::extract::Query<PageQuery>,
) -> Result<Json<Value>, ApiError> {
    let (page, per_page) = page_params(&q);
    let (users, total) = AdminQueries::new(&state.store)
        .list_users(page, per_page)
        .map_err(|_| ApiError::ServiceUnavailable)?;
    Ok(Json(json!({"success": true, "users": users, "total": total})))
}

async fn admin_user_detail(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let detail = AdminQueries::new(&state.store)
        .user_detail(user_id)
        .map_err(|_| ApiError::ServiceUnavailable)?
        .ok_or(ApiError::UnknownResource("المستخدم غير موجود"))?;
    Ok(Json(json!({"success": true, "detail": detail})))
}

#[derive(Debug, Deserialize)]
struct ToggleStatusRequest {
    user_id: i64,
}

async fn admin_toggle_status(
    State(state): State<AppState>,
    Json(req): Json<ToggleStatusRequest>,
) -> Result<Json<Value>, ApiError> {
    let status = AdminQueries::new(&state.store)
        .toggle_status(req.user_id, &state.config.admin_username)
        .map_err(|_| ApiError::UnknownResource("المستخدم غير موجود"))?;
    Ok(Json(json!({"success": true, "status": status})))
}

#[derive(Debug, Deserialize)]
struct UpdateTierRequest {
    user_id: i64,
    new_tier: String,
}

async fn admin_update_tier(
    State(state): State<AppState>,
    Json(req): Json<UpdateTierRequest>,
) -> Result<Json<Value>, ApiError> {
    let tier = Tier::parse(&req.new_tier)
        .ok_or_else(|| ApiError::Validation("مستوى الاشتراك غير صحيح".to_string()))?;
    AdminQueries::new(&state.store)
        .update_tier(req.user_id, tier, &state.config.admin_username)
        .map_err(|_| ApiError::UnknownResource("المستخدم غير موجود"))?;
    Ok(Json(json!({
        "success": true,
        "new_daily_limit": tier.daily_limit(),
    })))
}

async fn admin_analysis_logs(
    State(state): State<AppState>,
    axum::extract::Query(q): axum::extract::Query<PageQuery>,
    axum::extract::Query(filter): axum::extract::Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let (page, per_page) = page_params(&q);
    let user_id = filter.get("user_id").and_then(|s| s.parse::<i64>().ok());
    let (logs, total) = AdminQueries::new(&state.store)
        .list_logs(page, per_page, user_id)
        .map_err(|_| ApiError::ServiceUnavailable)?;
    Ok(Json(json!({"success": true, "logs": logs, "total": total})))
}

async fn admin_system_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "success": true,
        "cache_entries": state.cache.len(),
        "forex_pairs_configured": state.forex.len(),
    }))
}

fn public_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/gold-price", get(gold_price))
        .route("/forex-price/:pair", get(forex_price_handler))
        .route("/forex-pairs", get(forex_pairs_handler))
        .route("/analyze", post(analyze))
        .route("/analyze-forex", post(analyze_forex))
        .route("/analyze-chart", post(analyze_chart))
        .route("/analysis-types", get(analysis_types))
        .route("/api-status", get(api_status))
        .route("/quick-questions", get(quick_questions))
}

fn auth_router() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/user/:user_id", get(auth_user))
        .route("/auth/check-analysis-permission/:user_id", get(check_analysis_permission))
}

fn admin_router(state: AppState) -> Router<AppState> {
    let gated = Router::new()
        .route("/admin/dashboard", get(admin_dashboard))
        .route("/admin/users", get(admin_list_users))
        .route("/admin/users/:user_id", get(admin_user_detail))
        .route("/admin/users/toggle-status", post(admin_toggle_status))
        .route("/admin/users/update-tier", post(admin_update_tier))
        .route("/admin/analysis-logs", get(admin_analysis_logs))
        .route("/admin/system-status", get(admin_system_status))
        .route_layer(axum::middleware::from_fn_with_state(
            state.config.clone(),
            admin::admin_auth_middleware,
        ));

    Router::new()
        .route("/admin/login", post(admin_login))
        .merge(gated)
}

/// Assembles the full `/api`-prefixed router: public routes, the auth
/// surface, and the bearer-gated admin surface, merged the way the
/// teacher's `main.rs` merges `public_routes`/`protected_routes`/
/// `auth_router` before applying CORS and request-logging layers.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .merge(public_router())
        .merge(auth_router())
        .merge(admin_router(state.clone()))
        .with_state(state);

    Router::new().nest("/api", api)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_pair_inserts_slash_for_six_char_codes() {
        assert_eq!(display_pair("EURUSD"), "EUR/USD");
    }

    #[test]
    fn forex_name_ar_known_pair_resolves() {
        assert_eq!(forex_name_ar("USDJPY"), Some("الدولار/ين"));
        assert_eq!(forex_name_ar("XXXYYY"), None);
    }
}
