//! Orchestrates a single analysis request: permission check, price
//! snapshot, prompt composition, LLM call, caching, quota bookkeeping and
//! best-effort audit logging. Grounded in the teacher's `vault/llm.rs`
//! orchestration shape (a struct wrapping the pieces it calls in sequence,
//! timing the call with `Instant`, mapping failure into a typed outcome)
//! generalised from "produce a trade decision" to "produce a cached
//! analysis".

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::audit::{AuditHandle, AuditItem};
use crate::auth::{AuthEngine, PermissionCheck};
use crate::cache::{self, Cache};
use crate::clock::Clock;
use crate::config::Config;
use crate::llm::{self, LlmClient};
use crate::prompt::{AnalysisKind, ChartContext, ForexContext, PromptComposer};
use crate::store::Store;

/// The content an `analyze` call produces, owned by this pipeline and
/// handed to the cache and to the HTTP layer as an immutable copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub id: String,
    pub user_id: i64,
    pub kind: AnalysisKind,
    pub content: String,
    pub price_snapshot: Option<f64>,
    pub model_tag: String,
    pub processing_ms: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub enum AnalysisOutcome {
    /// Permission denied before any upstream work was attempted; quota
    /// untouched, nothing logged.
    Denied {
        reason: &'static str,
        message: &'static str,
        remaining: i64,
    },
    /// The LLM call failed or returned empty content. A failed
    /// `AnalysisLog` was recorded; quota was not consumed.
    LlmFailure { message: &'static str },
    Done {
        analysis: Analysis,
        cached: bool,
        remaining: i64,
    },
}

/// `md5(kind + ":" + context)[:16]`, matching the data model's fingerprint
/// definition exactly.
fn fingerprint(kind: AnalysisKind, context: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(context.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

/// Arabic message surfaced when a permission check denies the request.
/// `"daily-exhausted"` deliberately contains the literal phrase
/// "التحليل المجاني" ("the free analysis"), matching the canonical
/// source's wording for a basic-tier user who has used today's one slot.
fn denial_message(check: &PermissionCheck) -> &'static str {
    match check.reason {
        "user-not-found" => "المستخدم غير موجود",
        "inactive" => "الحساب غير نشط",
        "daily-exhausted" => {
            "لقد استنفدت حصة التحليل المجاني اليوم، يرجى المحاولة غداً أو الترقية للاشتراك المميز"
        }
        _ => "غير مصرح بإجراء هذا التحليل حالياً",
    }
}

pub struct AnalysisPipeline<'a> {
    store: &'a Store,
    clock: &'a dyn Clock,
    cache: &'a Cache,
    composer: &'a PromptComposer,
    llm: &'a LlmClient,
    audit: &'a AuditHandle,
    config: &'a Config,
}

impl<'a> AnalysisPipeline<'a> {
    pub fn new(
        store: &'a Store,
        clock: &'a dyn Clock,
        cache: &'a Cache,
        composer: &'a PromptComposer,
        llm: &'a LlmClient,
        audit: &'a AuditHandle,
        config: &'a Config,
    ) -> Self {
        Self {
            store,
            clock,
            cache,
            composer,
            llm,
            audit,
            config,
        }
    }

    fn auth(&self) -> AuthEngine<'a> {
        AuthEngine::new(self.store, self.clock)
    }

    fn user_tier_label(&self, user_id: i64) -> String {
        self.store
            .find_user_by_id(user_id)
            .ok()
            .flatten()
            .map(|u| u.tier.as_str().to_string())
            .unwrap_or_else(|| "basic".to_string())
    }

    /// The `quick` / `detailed` / `news` / `forecast` gold-price flows.
    /// `kind` must not be [`AnalysisKind::Chart`] — chart analyses go
    /// through [`Self::analyze_chart`], which has no gold price snapshot.
    pub async fn analyze_gold(
        &self,
        user_id: i64,
        kind: AnalysisKind,
        price: Option<&crate::price::PriceQuote>,
        free_text_context: Option<&str>,
    ) -> AnalysisOutcome {
        debug_assert_ne!(kind, AnalysisKind::Chart, "chart flow uses analyze_chart");

        let check = self.auth().can_analyze(user_id);
        if !check.allowed {
            return AnalysisOutcome::Denied {
                reason: check.reason,
                message: denial_message(&check),
                remaining: check.remaining,
            };
        }

        let now = self.clock.now();
        let (system_message, user_message) =
            self.composer.compose_gold(kind, price, free_text_context, now);
        let fingerprint_seed = PromptComposer::fingerprint_context(price, free_text_context);
        let price_snapshot = price.map(|q| q.price);

        self.run(user_id, kind, price_snapshot, system_message, user_message, fingerprint_seed, check)
            .await
    }

    pub async fn analyze_forex(
        &self,
        user_id: i64,
        kind: AnalysisKind,
        ctx: &ForexContext,
    ) -> AnalysisOutcome {
        let check = self.auth().can_analyze(user_id);
        if !check.allowed {
            return AnalysisOutcome::Denied {
                reason: check.reason,
                message: denial_message(&check),
                remaining: check.remaining,
            };
        }

        let now = self.clock.now();
        let (system_message, user_message) = self.composer.compose_forex(ctx, now);
        let fingerprint_seed = format!(
            "{}:{}",
            ctx.pair,
            PromptComposer::fingerprint_context(Some(&ctx.quote), ctx.additional_context.as_deref())
        );
        let price_snapshot = Some(ctx.quote.price);

        self.run(user_id, kind, price_snapshot, system_message, user_message, fingerprint_seed, check)
            .await
    }

    pub async fn analyze_chart(&self, user_id: i64, ctx: &ChartContext) -> AnalysisOutcome {
        let check = self.auth().can_analyze(user_id);
        if !check.allowed {
            return AnalysisOutcome::Denied {
                reason: check.reason,
                message: denial_message(&check),
                remaining: check.remaining,
            };
        }

        let now = self.clock.now();
        let (system_message, user_message) = self.composer.compose_chart(ctx, now);
        let fingerprint_seed = format!(
            "{}x{}:{}:{}",
            ctx.width,
            ctx.height,
            ctx.format,
            ctx.user_notes.as_deref().unwrap_or("")
        );

        self.run(
            user_id,
            AnalysisKind::Chart,
            None,
            system_message,
            user_message,
            fingerprint_seed,
            check,
        )
        .await
    }

    /// Shared cache-consult / LLM-call / record / audit tail common to all
    /// three entry points, corresponding to steps 3-7 of the operation.
    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        user_id: i64,
        kind: AnalysisKind,
        price_snapshot: Option<f64>,
        system_message: String,
        user_message: String,
        fingerprint_seed: String,
        check: PermissionCheck,
    ) -> AnalysisOutcome {
        let fp = fingerprint(kind, &fingerprint_seed);
        let cache_key = cache::keys::analysis(user_id, kind.as_str(), &fp);
        let user_tier = self.user_tier_label(user_id);

        if let Some(cached) = self.cache.get::<Analysis>(&cache_key) {
            self.audit.log(AuditItem {
                user_id,
                kind,
                success: true,
                processing_ms: 0,
                error: None,
                user_tier,
                price_at_request: price_snapshot,
            });
            return AnalysisOutcome::Done {
                analysis: cached,
                cached: true,
                remaining: check.remaining,
            };
        }

        let session = llm::session_id(user_id, self.clock.now().timestamp());
        let start = Instant::now();
        let result = self
            .llm
            .chat_completion(
                &self.config.llm_model,
                &system_message,
                &user_message,
                self.config.llm_max_tokens,
                self.config.llm_temperature,
                &session,
            )
            .await;
        let processing_ms = start.elapsed().as_millis() as i64;

        let content = match &result {
            Ok(out) if !out.content.trim().is_empty() => Some(out.content.clone()),
            _ => None,
        };

        let Some(content) = content else {
            let error = match &result {
                Err(e) => e.to_string(),
                Ok(_) => "empty LLM response".to_string(),
            };
            self.audit.log(AuditItem {
                user_id,
                kind,
                success: false,
                processing_ms,
                error: Some(error),
                user_tier,
                price_at_request: price_snapshot,
            });
            return AnalysisOutcome::LlmFailure {
                message: "تعذر إكمال التحليل حالياً، يرجى المحاولة مرة أخرى",
            };
        };

        let model_tag = result.map(|o| o.model).unwrap_or_default();
        let analysis = Analysis {
            id: Uuid::new_v4().to_string(),
            user_id,
            kind,
            content,
            price_snapshot,
            model_tag,
            processing_ms,
            created_at: self.clock.now(),
        };
        self.cache.set(
            &cache_key,
            &analysis,
            Duration::from_secs(self.config.analysis_cache_ttl_secs),
        );

        // record_analysis bumps the counters via a compare-and-swap against
        // the row it reads, so a concurrent caller for the same user cannot
        // land both writes against a tier limit of one. If every CAS
        // attempt loses the race (or the quota was exhausted by the time
        // this lands), the already-generated analysis is still returned —
        // the novel work already happened — but the failure is logged since
        // it means the counters no longer reflect this call.
        if let Err(err) = self.auth().record_analysis(user_id) {
            warn!(user_id, error = ?err, "record_analysis did not land after generating analysis");
        }
        let remaining = self.auth().can_analyze(user_id).remaining;

        self.audit.log(AuditItem {
            user_id,
            kind,
            success: true,
            processing_ms,
            error: None,
            user_tier: self.user_tier_label(user_id),
            price_at_request: price_snapshot,
        });

        AnalysisOutcome::Done {
            analysis,
            cached: false,
            remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::spawn_recorder;
    use crate::clock::SystemClock;
    use crate::price::PriceQuote;
    use std::sync::Arc;

    fn sample_quote() -> PriceQuote {
        PriceQuote {
            price: 3300.0,
            change: 1.0,
            change_pct: 0.1,
            ask: 3302.0,
            bid: 3298.0,
            high_24h: 3315.0,
            low_24h: 3285.0,
            source: "test".to_string(),
            observed_at: Utc::now(),
        }
    }

    fn config() -> Config {
        std::env::set_var("LLM_API_KEY", "test-key");
        let cfg = Config::from_env().unwrap();
        std::env::remove_var("LLM_API_KEY");
        cfg
    }

    #[tokio::test]
    async fn denied_when_quota_exhausted_does_not_touch_llm() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = Store::new(file.path().to_str().unwrap()).unwrap();
        let clock = SystemClock;
        let cache = Cache::new();
        let composer = PromptComposer::new("Gold Nightmare");
        let llm = LlmClient::new(reqwest::Client::new(), "unused");
        let audit = spawn_recorder(Arc::new(Store::new(file.path().to_str().unwrap()).unwrap()));
        let cfg = config();

        let auth = AuthEngine::new(&store, &clock);
        let reg = auth.register("a@b.com", "abc123", None).unwrap();

        let pipeline = AnalysisPipeline::new(&store, &clock, &cache, &composer, &llm, &audit, &cfg);

        // First call would need a live LLM; instead we exhaust the quota
        // directly and verify the second call is denied before any
        // upstream work is attempted.
        auth.record_analysis(reg.user_id).unwrap();

        let outcome = pipeline
            .analyze_gold(reg.user_id, AnalysisKind::Quick, Some(&sample_quote()), None)
            .await;

        match outcome {
            AnalysisOutcome::Denied { reason, message, remaining } => {
                assert_eq!(reason, "daily-exhausted");
                assert!(message.contains("التحليل المجاني"));
                assert_eq!(remaining, 0);
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn fingerprint_is_deterministic_and_kind_sensitive() {
        let a = fingerprint(AnalysisKind::Quick, "3300.00:none");
        let b = fingerprint(AnalysisKind::Quick, "3300.00:none");
        let c = fingerprint(AnalysisKind::Detailed, "3300.00:none");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }
}
