//! Admin bearer-token issuance/verification and the read/mutate surface
//! behind `/admin/*`. Grounded in the teacher's `auth/middleware.rs`
//! (`auth_middleware` extracting and validating a Bearer token, mapping
//! failure to a typed `IntoResponse` error) and `auth/jwt.rs` (sign/verify
//! split around a secret), generalised from JWT to a lighter HMAC-signed
//! token per the REDESIGN resolution: the source's admin auth was a literal
//! string compare issuing a fixed placeholder token, which cannot survive
//! multiple admins or any expiry and is replaced here with a verifiable,
//! expiring, constant-time-checked signature.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::config::Config;
use crate::store::{AnalysisLog, DailySummary, Store, Tier, UserRecord, UserStatus};

type HmacSha256 = Hmac<Sha256>;

fn sign(secret: &str, issued_at: i64) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts a key of any length");
    mac.update(issued_at.to_string().as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Issues `"{issued_at}.{signature}"`, signed with `admin_token_secret`.
pub fn issue_admin_token(secret: &str, now: DateTime<Utc>) -> String {
    let issued_at = now.timestamp();
    format!("{issued_at}.{}", sign(secret, issued_at))
}

/// Verifies the token's signature in constant time and that it hasn't
/// outlived `ttl_secs`. A malformed token (wrong shape, non-numeric
/// timestamp) is rejected the same as a bad signature.
pub fn verify_admin_token(token: &str, secret: &str, ttl_secs: i64, now: DateTime<Utc>) -> bool {
    let Some((issued_at_raw, signature)) = token.split_once('.') else {
        return false;
    };
    let Ok(issued_at) = issued_at_raw.parse::<i64>() else {
        return false;
    };
    if now.timestamp() - issued_at > ttl_secs || issued_at > now.timestamp() {
        return false;
    }
    let expected = sign(secret, issued_at);
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

/// Constant-time comparison against the configured admin password; the
/// username is compared plainly since it isn't a secret.
pub fn verify_admin_credentials(config: &Config, username: &str, password: &str) -> bool {
    username == config.admin_username
        && password.as_bytes().ct_eq(config.admin_password.as_bytes()).into()
}

#[derive(Debug)]
pub enum AdminAuthError {
    MissingToken,
    InvalidToken,
}

impl IntoResponse for AdminAuthError {
    fn into_response(self) -> Response {
        let message = match self {
            AdminAuthError::MissingToken => "مصادقة الإدارة مطلوبة",
            AdminAuthError::InvalidToken => "رمز الدخول غير صالح أو منتهي الصلاحية",
        };
        (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({"success": false, "error": message})),
        )
            .into_response()
    }
}

/// Gates every `/admin/*` route. Constructed with `State(config):
/// State<Arc<Config>>` via `axum::middleware::from_fn_with_state`, matching
/// the teacher's `State(jwt_handler): State<Arc<JwtHandler>>` shape.
pub async fn admin_auth_middleware(
    State(config): State<Arc<Config>>,
    req: Request,
    next: Next,
) -> Result<Response, AdminAuthError> {
    let token = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .ok_or(AdminAuthError::MissingToken)?;

    if !verify_admin_token(token, &config.admin_token_secret, config.admin_token_ttl_secs, Utc::now()) {
        return Err(AdminAuthError::InvalidToken);
    }

    Ok(next.run(req).await)
}

#[derive(Debug, Clone, Serialize)]
pub struct UserListEntry {
    #[serde(flatten)]
    pub user: UserRecord,
    pub requests_today: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserDetail {
    pub user: UserRecord,
    pub recent_logs: Vec<AnalysisLog>,
    pub recent_summaries: Vec<DailySummary>,
    pub avg_response_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierBreakdown {
    pub basic: i64,
    pub premium: i64,
    pub vip: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub total_users: i64,
    pub tier_breakdown: TierBreakdown,
    pub total_analyses_lifetime: i64,
    pub analyses_today: i64,
    pub analyses_yesterday: i64,
    pub success_rate_7d: f64,
    pub mean_latency_ms_7d: f64,
    pub recent_activity: Vec<AnalysisLog>,
}

/// Days of history the dashboard's rolling success-rate window covers.
const DASHBOARD_WINDOW_DAYS: i64 = 7;
/// Depth of the dashboard's "recent activity" feed.
const RECENT_ACTIVITY_LIMIT: u32 = 20;
/// Depth of the user-detail view's log/summary slices.
const USER_DETAIL_LOG_LIMIT: u32 = 30;
const USER_DETAIL_SUMMARY_DAYS: u32 = 7;

/// Stateless read façade over [`Store`], plus the two admin-triggered
/// mutations (`toggle_status`, `update_tier`) that pair their state change
/// with an `admin_audit` record.
pub struct AdminQueries<'a> {
    store: &'a Store,
}

impl<'a> AdminQueries<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn list_users(&self, page: u32, per_page: u32) -> anyhow::Result<(Vec<UserListEntry>, i64)> {
        let (users, total) = self.store.list_users(page, per_page)?;
        let today = Utc::now().date_naive();
        let entries = users
            .into_iter()
            .map(|user| {
                let requests_today = self
                    .store
                    .get_daily_summary(user.user_id, today)
                    .ok()
                    .flatten()
                    .map(|s| s.total)
                    .unwrap_or(0);
                UserListEntry { user, requests_today }
            })
            .collect();
        Ok((entries, total))
    }

    pub fn user_detail(&self, user_id: i64) -> anyhow::Result<Option<UserDetail>> {
        let Some(user) = self.store.find_user_by_id(user_id)? else {
            return Ok(None);
        };
        let recent_logs = self.store.recent_logs_for_user(user_id, USER_DETAIL_LOG_LIMIT)?;
        let recent_summaries = self
            .store
            .recent_summaries_for_user(user_id, USER_DETAIL_SUMMARY_DAYS)?;

        let avg_response_ms = if recent_logs.is_empty() {
            0.0
        } else {
            recent_logs.iter().map(|l| l.processing_ms as f64).sum::<f64>() / recent_logs.len() as f64
        };

        Ok(Some(UserDetail {
            user,
            recent_logs,
            recent_summaries,
            avg_response_ms,
        }))
    }

    pub fn list_logs(
        &self,
        page: u32,
        per_page: u32,
        user_id: Option<i64>,
    ) -> anyhow::Result<(Vec<AnalysisLog>, i64)> {
        self.store.list_logs(page, per_page, user_id)
    }

    pub fn dashboard(&self) -> anyhow::Result<Dashboard> {
        let total_users = {
            let (_, total) = self.store.list_users(1, 1)?;
            total
        };
        let (basic, premium, vip) = self.store.count_users_by_tier()?;
        let total_analyses_lifetime = self.store.total_analyses_lifetime()?;

        let today = Utc::now().date_naive();
        let yesterday = today - chrono::Duration::days(1);
        let analyses_today = self.store.count_logs_on_date(today)?;
        let analyses_yesterday = self.store.count_logs_on_date(yesterday)?;

        let since = Utc::now() - chrono::Duration::days(DASHBOARD_WINDOW_DAYS);
        let (successful_7d, total_7d, mean_latency_ms_7d) = self.store.logs_stats_since(since)?;
        let success_rate_7d = if total_7d == 0 {
            0.0
        } else {
            successful_7d as f64 / total_7d as f64
        };

        let (recent_activity, _) = self.store.list_logs(1, RECENT_ACTIVITY_LIMIT, None)?;

        Ok(Dashboard {
            total_users,
            tier_breakdown: TierBreakdown { basic, premium, vip },
            total_analyses_lifetime,
            analyses_today,
            analyses_yesterday,
            success_rate_7d,
            mean_latency_ms_7d,
            recent_activity,
        })
    }

    /// Flips active<->inactive; blocked/suspended users are left untouched
    /// per the invariant that those statuses aren't self-service-reversible
    /// from the admin toggle. Records an `admin_audit` entry regardless of
    /// whether the status actually changed.
    pub fn toggle_status(&self, user_id: i64, admin_id: &str) -> anyhow::Result<UserStatus> {
        use crate::auth::AuthEngine;
        use crate::clock::SystemClock;

        let clock = SystemClock;
        let engine = AuthEngine::new(self.store, &clock);
        let new_status = engine
            .toggle_status(user_id)
            .map_err(|_| anyhow::anyhow!("user not found"))?;

        self.store.insert_admin_audit_entry(
            admin_id,
            "status_toggle",
            Some(user_id),
            Some(new_status.as_str()),
        )?;
        Ok(new_status)
    }

    pub fn update_tier(&self, user_id: i64, new_tier: Tier, admin_id: &str) -> anyhow::Result<()> {
        use crate::auth::AuthEngine;
        use crate::clock::SystemClock;

        let clock = SystemClock;
        let engine = AuthEngine::new(self.store, &clock);
        engine
            .update_tier(user_id, new_tier)
            .map_err(|_| anyhow::anyhow!("user not found"))?;

        self.store.insert_admin_audit_entry(
            admin_id,
            "tier_change",
            Some(user_id),
            Some(new_tier.as_str()),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthEngine;
    use crate::clock::SystemClock;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    fn harness() -> (Store, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let store = Store::new(file.path().to_str().unwrap()).unwrap();
        (store, file)
    }

    #[test]
    fn issued_token_verifies_within_ttl() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let token = issue_admin_token("secret", now);
        assert!(verify_admin_token(&token, "secret", 43200, now));
    }

    #[test]
    fn token_rejected_after_ttl_elapses() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let token = issue_admin_token("secret", now);
        let later = now + chrono::Duration::seconds(43201);
        assert!(!verify_admin_token(&token, "secret", 43200, later));
    }

    #[test]
    fn token_rejected_with_wrong_secret() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let token = issue_admin_token("secret", now);
        assert!(!verify_admin_token(&token, "other-secret", 43200, now));
    }

    #[test]
    fn malformed_token_rejected() {
        let now = Utc::now();
        assert!(!verify_admin_token("not-a-token", "secret", 43200, now));
        assert!(!verify_admin_token("abc.def", "secret", 43200, now));
    }

    #[test]
    fn toggle_status_flips_and_audits() {
        let (store, _f) = harness();
        let clock = SystemClock;
        let auth = AuthEngine::new(&store, &clock);
        let reg = auth.register("a@b.com", "abc123", None).unwrap();

        let admin = AdminQueries::new(&store);
        let status = admin.toggle_status(reg.user_id, "admin").unwrap();
        assert_eq!(status, UserStatus::Inactive);

        let (entries, total) = store.list_admin_audit(1, 10).unwrap();
        assert_eq!(total, 1);
        assert_eq!(entries[0].action, "status_toggle");
    }

    #[test]
    fn update_tier_resets_quota_and_audits() {
        let (store, _f) = harness();
        let clock = SystemClock;
        let auth = AuthEngine::new(&store, &clock);
        let reg = auth.register("a@b.com", "abc123", None).unwrap();
        auth.record_analysis(reg.user_id).unwrap();

        let admin = AdminQueries::new(&store);
        admin.update_tier(reg.user_id, Tier::Premium, "admin").unwrap();

        let check = auth.can_analyze(reg.user_id);
        assert_eq!(check.remaining, 5);

        let (entries, _) = store.list_admin_audit(1, 10).unwrap();
        assert_eq!(entries[0].action, "tier_change");
    }

    #[test]
    fn dashboard_reports_tier_breakdown_and_activity() {
        let (store, _f) = harness();
        let clock = SystemClock;
        let auth = AuthEngine::new(&store, &clock);
        let basic = auth.register("a@b.com", "abc123", None).unwrap();
        let vip = auth.register("b@b.com", "abc123", None).unwrap();
        auth.update_tier(vip.user_id, Tier::Vip).unwrap();

        store
            .insert_analysis_log(basic.user_id, crate::prompt::AnalysisKind::Quick, true, 120, None, "basic", Some(3300.0))
            .unwrap();

        let admin = AdminQueries::new(&store);
        let dashboard = admin.dashboard().unwrap();
        assert_eq!(dashboard.total_users, 2);
        assert_eq!(dashboard.tier_breakdown.vip, 1);
        assert_eq!(dashboard.recent_activity.len(), 1);
    }
}
