//! Builds the LLM prompt text for each analysis kind. The pipeline treats
//! kinds as opaque identifiers; this module owns every word that ends up in
//! front of the model, mirroring the prompt-building methods on the
//! source's `ai_manager.py` and the inline templates in its `server.py`
//! route handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::price::PriceQuote;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisKind {
    Quick,
    Detailed,
    Chart,
    News,
    Forecast,
}

impl AnalysisKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisKind::Quick => "quick",
            AnalysisKind::Detailed => "detailed",
            AnalysisKind::Chart => "chart",
            AnalysisKind::News => "news",
            AnalysisKind::Forecast => "forecast",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "quick" => Some(AnalysisKind::Quick),
            "detailed" => Some(AnalysisKind::Detailed),
            "chart" => Some(AnalysisKind::Chart),
            "news" => Some(AnalysisKind::News),
            "forecast" => Some(AnalysisKind::Forecast),
            _ => None,
        }
    }

    /// Whether a gold price snapshot is a hard requirement for this kind.
    /// `news` can proceed without one; every other kind needs at least a
    /// best-effort quote in the prompt.
    pub fn requires_price(&self) -> bool {
        !matches!(self, AnalysisKind::News)
    }

    pub fn display_name_ar(&self) -> &'static str {
        match self {
            AnalysisKind::Quick => "تحليل سريع",
            AnalysisKind::Detailed => "تحليل مفصل",
            AnalysisKind::Chart => "تحليل شارت",
            AnalysisKind::News => "تحليل إخباري",
            AnalysisKind::Forecast => "توقعات مستقبلية",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            AnalysisKind::Quick => "⚡",
            AnalysisKind::Detailed => "📊",
            AnalysisKind::Chart => "📈",
            AnalysisKind::News => "📰",
            AnalysisKind::Forecast => "🔮",
        }
    }
}

/// Context supplied to a chart-analysis request: decoded image metadata and
/// whatever the caller typed alongside the upload.
#[derive(Debug, Clone)]
pub struct ChartContext {
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub size_kb: f64,
    pub user_notes: Option<String>,
}

/// Context for a forex-pair analysis: the pair's display name plus its
/// latest OHLC snapshot.
#[derive(Debug, Clone)]
pub struct ForexContext {
    pub pair: String,
    pub pair_name_ar: String,
    pub quote: PriceQuote,
    pub additional_context: Option<String>,
}

const SYSTEM_PERSONA: &str = "أنت محلل أسواق مالية خبير متخصص في تحليل الذهب والعملات، \
تعمل ضمن نظام Gold Nightmare. تقدم تحليلات فنية ودقيقة باللغة العربية، \
معتمداً على البيانات المتاحة دون افتراض معلومات غير مؤكدة.";

const DISCLAIMER: &str =
    "⚠️ تنويه: هذا التحليل لأغراض تعليمية فقط وليس نصيحة استثمارية أو مالية ملزمة.";

fn sign_off(bot_signature: &str) -> String {
    format!("التوقيع: 🏆 {bot_signature}")
}

/// Builds the system + user message pair handed to [`crate::llm::LlmClient`].
pub struct PromptComposer {
    bot_signature: String,
}

impl PromptComposer {
    pub fn new(bot_signature: impl Into<String>) -> Self {
        Self {
            bot_signature: bot_signature.into(),
        }
    }

    /// Builds the prompt for the gold-price kinds (`quick`, `detailed`,
    /// `forecast`) and for `news`, which shares the same shape minus the
    /// hard price requirement.
    pub fn compose_gold(
        &self,
        kind: AnalysisKind,
        price: Option<&PriceQuote>,
        free_text_context: Option<&str>,
        now: DateTime<Utc>,
    ) -> (String, String) {
        let price_block = match price {
            Some(q) => format!(
                "سعر الذهب الحالي: {:.2} دولار للأونصة (تغير: {:.2} / {:.2}%)\n\
                 أعلى 24 ساعة: {:.2} | أدنى 24 ساعة: {:.2} | المصدر: {}",
                q.price, q.change, q.change_pct, q.high_24h, q.low_24h, q.source
            ),
            None => "لا تتوفر بيانات سعرية مباشرة لهذا الطلب.".to_string(),
        };

        let (header, sections, length_hint) = match kind {
            AnalysisKind::Quick => (
                "📊 **تحليل سريع للذهب:**",
                "اتجاه السوق، توصية مختصرة بسطر واحد، هدف سعري واحد، مستوى وقف الخسارة، تحذير مخاطرة.",
                "100-200 كلمة",
            ),
            AnalysisKind::Detailed => (
                "📊 **التحليل الفني المفصل:**",
                "التحليل الفني، المؤشرات، خطة التداول، السيناريوهات المحتملة، إدارة المخاطر.",
                "400-600 كلمة",
            ),
            AnalysisKind::News => (
                "📰 **التحليل الإخباري:**",
                "العوامل الاقتصادية والجيوسياسية المؤثرة، التوقعات قصيرة ومتوسطة المدى.",
                "300-400 كلمة",
            ),
            AnalysisKind::Forecast => (
                "🔮 **التوقعات المستقبلية:**",
                "توقعات أسبوعية وشهرية، السيناريوهات المحتملة، خطة تداول مقترحة.",
                "400-500 كلمة",
            ),
            AnalysisKind::Chart => unreachable!("chart analyses use compose_chart"),
        };

        let context_line = free_text_context
            .map(|c| format!("\nملاحظات إضافية من المستخدم: {c}"))
            .unwrap_or_default();

        let user_message = format!(
            "{header}\n\n{price_block}\n\nالتاريخ والوقت (UTC): {timestamp}\n{context_line}\n\n\
             المطلوب ({length_hint}): {sections}\n\n{disclaimer}\n{signature}",
            header = header,
            price_block = price_block,
            timestamp = now.to_rfc3339(),
            context_line = context_line,
            length_hint = length_hint,
            sections = sections,
            disclaimer = DISCLAIMER,
            signature = sign_off(&self.bot_signature),
        );

        (SYSTEM_PERSONA.to_string(), user_message)
    }

    pub fn compose_forex(&self, ctx: &ForexContext, now: DateTime<Utc>) -> (String, String) {
        let q = &ctx.quote;
        let context_line = ctx
            .additional_context
            .as_deref()
            .filter(|c| !c.is_empty())
            .map(|c| format!("\nملاحظات إضافية من المستخدم: {c}"))
            .unwrap_or_default();

        let user_message = format!(
            "📈 **تحليل فني لزوج {pair_name} ({pair}):**\n\n\
             السعر الحالي: {price:.4} (تغير: {change:.4} / {change_pct:.2}%)\n\
             أعلى 24 ساعة: {high:.4} | أدنى 24 ساعة: {low:.4} | المصدر: {source}\n\n\
             التاريخ والوقت (UTC): {timestamp}\n{context_line}\n\n\
             المطلوب (300-500 كلمة): التحليل الفني، العوامل الاقتصادية المؤثرة، \
             التوصيات التداولية، السيناريوهات المحتملة، إدارة المخاطر.\n\n{disclaimer}\n{signature}",
            pair_name = ctx.pair_name_ar,
            pair = ctx.pair,
            price = q.price,
            change = q.change,
            change_pct = q.change_pct,
            high = q.high_24h,
            low = q.low_24h,
            source = q.source,
            timestamp = now.to_rfc3339(),
            context_line = context_line,
            disclaimer = DISCLAIMER,
            signature = sign_off(&self.bot_signature),
        );

        (SYSTEM_PERSONA.to_string(), user_message)
    }

    pub fn compose_chart(&self, ctx: &ChartContext, now: DateTime<Utc>) -> (String, String) {
        let notes_line = ctx
            .user_notes
            .as_deref()
            .map(|n| format!("\nملاحظات المستخدم: {n}"))
            .unwrap_or_default();

        let user_message = format!(
            "📈 **تحليل الشارت البياني:**\n\n\
             أبعاد الصورة: {w}x{h} ({fmt}, {kb:.1} كيلوبايت){notes}\n\n\
             التاريخ والوقت (UTC): {timestamp}\n\n\
             المطلوب (300-500 كلمة): النمط الفني الظاهر، مستويات الدعم والمقاومة، \
             التباعد (Divergence) إن وجد، سيناريو صاعد وسيناريو هابط.\n\n{disclaimer}\n{signature}",
            w = ctx.width,
            h = ctx.height,
            fmt = ctx.format,
            kb = ctx.size_kb,
            notes = notes_line,
            timestamp = now.to_rfc3339(),
            disclaimer = DISCLAIMER,
            signature = sign_off(&self.bot_signature),
        );

        (SYSTEM_PERSONA.to_string(), user_message)
    }

    /// Raw text used to build the cache fingerprint: kind-independent so
    /// the same composed context hashes the same way regardless of how the
    /// prompt wording evolves.
    pub fn fingerprint_context(price: Option<&PriceQuote>, free_text_context: Option<&str>) -> String {
        let price_part = price
            .map(|q| format!("{:.2}", q.price))
            .unwrap_or_else(|| "none".to_string());
        format!("{price_part}:{}", free_text_context.unwrap_or(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_quote() -> PriceQuote {
        PriceQuote {
            price: 3350.25,
            change: 12.5,
            change_pct: 0.37,
            ask: 3350.5,
            bid: 3350.0,
            high_24h: 3360.0,
            low_24h: 3330.0,
            source: "test-provider".to_string(),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn compose_gold_embeds_disclaimer_and_signature() {
        let composer = PromptComposer::new("Gold Nightmare – عدي");
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let (system, user) = composer.compose_gold(AnalysisKind::Quick, Some(&sample_quote()), None, now);
        assert_eq!(system, SYSTEM_PERSONA);
        assert!(user.contains(DISCLAIMER));
        assert!(user.contains("التوقيع"));
        assert!(user.contains("3350.25"));
    }

    #[test]
    fn compose_gold_without_price_still_produces_prompt() {
        let composer = PromptComposer::new("Gold Nightmare – عدي");
        let now = Utc::now();
        let (_, user) = composer.compose_gold(AnalysisKind::News, None, Some("أثر التضخم"), now);
        assert!(user.contains("لا تتوفر بيانات سعرية"));
        assert!(user.contains("أثر التضخم"));
    }

    #[test]
    fn fingerprint_context_is_stable_for_same_inputs() {
        let a = PromptComposer::fingerprint_context(Some(&sample_quote()), Some("x"));
        let b = PromptComposer::fingerprint_context(Some(&sample_quote()), Some("x"));
        assert_eq!(a, b);
    }

    #[test]
    fn analysis_kind_round_trips_through_str() {
        for kind in [
            AnalysisKind::Quick,
            AnalysisKind::Detailed,
            AnalysisKind::Chart,
            AnalysisKind::News,
            AnalysisKind::Forecast,
        ] {
            assert_eq!(AnalysisKind::parse(kind.as_str()), Some(kind));
        }
    }
}
