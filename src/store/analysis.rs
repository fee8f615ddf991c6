use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use uuid::Uuid;

use super::Store;
use crate::prompt::AnalysisKind;

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisLog {
    pub id: String,
    pub user_id: i64,
    pub kind: AnalysisKind,
    pub success: bool,
    pub processing_ms: i64,
    pub error: Option<String>,
    pub user_tier: String,
    pub price_at_request: Option<f64>,
    pub created_at: DateTime<Utc>,
}

fn row_to_log(row: &Row) -> rusqlite::Result<AnalysisLog> {
    let kind_raw: String = row.get("kind")?;
    let created_at_raw: String = row.get("created_at")?;
    Ok(AnalysisLog {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        kind: AnalysisKind::parse(&kind_raw).unwrap_or(AnalysisKind::Quick),
        success: row.get::<_, i64>("success")? != 0,
        processing_ms: row.get("processing_ms")?,
        error: row.get("error")?,
        user_tier: row.get("user_tier")?,
        price_at_request: row.get("price_at_request")?,
        created_at: DateTime::parse_from_rfc3339(&created_at_raw)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct KindBreakdown {
    pub quick: i64,
    pub detailed: i64,
    pub chart: i64,
    pub news: i64,
    pub forecast: i64,
}

impl KindBreakdown {
    fn bump(&mut self, kind: AnalysisKind) {
        match kind {
            AnalysisKind::Quick => self.quick += 1,
            AnalysisKind::Detailed => self.detailed += 1,
            AnalysisKind::Chart => self.chart += 1,
            AnalysisKind::News => self.news += 1,
            AnalysisKind::Forecast => self.forecast += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DailySummary {
    pub user_id: i64,
    pub date: NaiveDate,
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
    pub kinds: KindBreakdown,
    pub mean_ms: f64,
}

fn row_to_summary(row: &Row) -> rusqlite::Result<DailySummary> {
    let date_raw: String = row.get("date")?;
    Ok(DailySummary {
        user_id: row.get("user_id")?,
        date: NaiveDate::parse_from_str(&date_raw, "%Y-%m-%d")
            .unwrap_or_else(|_| Utc::now().date_naive()),
        total: row.get("total")?,
        successful: row.get("successful")?,
        failed: row.get("failed")?,
        kinds: KindBreakdown {
            quick: row.get("kind_quick")?,
            detailed: row.get("kind_detailed")?,
            chart: row.get("kind_chart")?,
            news: row.get("kind_news")?,
            forecast: row.get("kind_forecast")?,
        },
        mean_ms: row.get("mean_ms")?,
    })
}

impl Store {
    pub fn insert_analysis_log(
        &self,
        user_id: i64,
        kind: AnalysisKind,
        success: bool,
        processing_ms: i64,
        error: Option<&str>,
        user_tier: &str,
        price_at_request: Option<f64>,
    ) -> Result<String> {
        let conn = self.conn()?;
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO analysis_logs (
                id, user_id, kind, success, processing_ms, error, user_tier,
                price_at_request, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                user_id,
                kind.as_str(),
                success as i64,
                processing_ms,
                error,
                user_tier,
                price_at_request,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("inserting analysis log")?;
        Ok(id)
    }

    pub fn list_logs(
        &self,
        page: u32,
        per_page: u32,
        user_id: Option<i64>,
    ) -> Result<(Vec<AnalysisLog>, i64)> {
        let conn = self.conn()?;
        let offset = (page.saturating_sub(1)) as i64 * per_page as i64;

        let (total, rows) = if let Some(uid) = user_id {
            let total: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM analysis_logs WHERE user_id = ?1",
                    params![uid],
                    |r| r.get(0),
                )
                .context("counting user logs")?;
            let mut stmt = conn.prepare(
                "SELECT * FROM analysis_logs WHERE user_id = ?1
                 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt
                .query_map(params![uid, per_page as i64, offset], row_to_log)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            (total, rows)
        } else {
            let total: i64 = conn
                .query_row("SELECT COUNT(*) FROM analysis_logs", [], |r| r.get(0))
                .context("counting logs")?;
            let mut stmt = conn.prepare(
                "SELECT * FROM analysis_logs ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
            )?;
            let rows = stmt
                .query_map(params![per_page as i64, offset], row_to_log)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            (total, rows)
        };

        Ok((rows, total))
    }

    pub fn recent_logs_for_user(&self, user_id: i64, limit: u32) -> Result<Vec<AnalysisLog>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM analysis_logs WHERE user_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], row_to_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Count of analysis logs created on one calendar day, for the
    /// dashboard's today-vs-yesterday delta.
    pub fn count_logs_on_date(&self, date: NaiveDate) -> Result<i64> {
        let conn = self.conn()?;
        let prefix = format!("{}%", date.format("%Y-%m-%d"));
        conn.query_row(
            "SELECT COUNT(*) FROM analysis_logs WHERE created_at LIKE ?1",
            params![prefix],
            |r| r.get(0),
        )
        .context("counting logs on date")
    }

    /// `(successful, total, mean_processing_ms)` over logs created on or
    /// after `since`, for the dashboard's 7-day success rate and latency.
    pub fn logs_stats_since(&self, since: DateTime<Utc>) -> Result<(i64, i64, f64)> {
        let conn = self.conn()?;
        let total: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM analysis_logs WHERE created_at >= ?1",
                params![since.to_rfc3339()],
                |r| r.get(0),
            )
            .context("counting recent logs")?;
        let successful: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM analysis_logs WHERE created_at >= ?1 AND success = 1",
                params![since.to_rfc3339()],
                |r| r.get(0),
            )
            .context("counting recent successful logs")?;
        let mean_ms: Option<f64> = conn
            .query_row(
                "SELECT AVG(processing_ms) FROM analysis_logs WHERE created_at >= ?1",
                params![since.to_rfc3339()],
                |r| r.get(0),
            )
            .context("averaging recent processing time")?;
        Ok((successful, total, mean_ms.unwrap_or(0.0)))
    }

    pub fn get_daily_summary(&self, user_id: i64, date: NaiveDate) -> Result<Option<DailySummary>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM daily_summaries WHERE user_id = ?1 AND date = ?2",
            params![user_id, date.format("%Y-%m-%d").to_string()],
            row_to_summary,
        )
        .optional()
        .context("reading daily summary")
    }

    pub fn recent_summaries_for_user(
        &self,
        user_id: i64,
        limit_days: u32,
    ) -> Result<Vec<DailySummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM daily_summaries WHERE user_id = ?1
             ORDER BY date DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit_days as i64], row_to_summary)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Upserts the `(user_id, date)` daily summary, bumping counters and
    /// recomputing the running mean latency: `new_mean = old_mean +
    /// (sample - old_mean) / new_total`, matching the source's incremental
    /// formula.
    pub fn record_daily_summary_sample(
        &self,
        user_id: i64,
        date: NaiveDate,
        kind: AnalysisKind,
        success: bool,
        processing_ms: i64,
    ) -> Result<()> {
        let conn = self.conn()?;
        let existing = conn
            .query_row(
                "SELECT * FROM daily_summaries WHERE user_id = ?1 AND date = ?2",
                params![user_id, date.format("%Y-%m-%d").to_string()],
                row_to_summary,
            )
            .optional()
            .context("reading daily summary for update")?;

        let mut summary = existing.unwrap_or(DailySummary {
            user_id,
            date,
            total: 0,
            successful: 0,
            failed: 0,
            kinds: KindBreakdown::default(),
            mean_ms: 0.0,
        });

        summary.total += 1;
        if success {
            summary.successful += 1;
        } else {
            summary.failed += 1;
        }
        summary.kinds.bump(kind);
        summary.mean_ms += (processing_ms as f64 - summary.mean_ms) / summary.total as f64;

        conn.execute(
            "INSERT INTO daily_summaries (
                user_id, date, total, successful, failed,
                kind_quick, kind_detailed, kind_chart, kind_news, kind_forecast, mean_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(user_id, date) DO UPDATE SET
                total = excluded.total,
                successful = excluded.successful,
                failed = excluded.failed,
                kind_quick = excluded.kind_quick,
                kind_detailed = excluded.kind_detailed,
                kind_chart = excluded.kind_chart,
                kind_news = excluded.kind_news,
                kind_forecast = excluded.kind_forecast,
                mean_ms = excluded.mean_ms",
            params![
                summary.user_id,
                summary.date.format("%Y-%m-%d").to_string(),
                summary.total,
                summary.successful,
                summary.failed,
                summary.kinds.quick,
                summary.kinds.detailed,
                summary.kinds.chart,
                summary.kinds.news,
                summary.kinds.forecast,
                summary.mean_ms,
            ],
        )
        .context("upserting daily summary")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::temp_store;
    use super::*;

    #[test]
    fn record_daily_summary_sample_tracks_running_mean() {
        let (store, _f) = temp_store();
        let date = Utc::now().date_naive();

        store
            .record_daily_summary_sample(1000, date, AnalysisKind::Quick, true, 100)
            .unwrap();
        store
            .record_daily_summary_sample(1000, date, AnalysisKind::Quick, true, 300)
            .unwrap();

        let summary = store.get_daily_summary(1000, date).unwrap().unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.successful, 2);
        assert_eq!(summary.kinds.quick, 2);
        assert!((summary.mean_ms - 200.0).abs() < 1e-9);
    }

    #[test]
    fn logs_stats_since_computes_success_rate_and_mean() {
        let (store, _f) = temp_store();
        let far_past = Utc::now() - chrono::Duration::days(1);
        store
            .insert_analysis_log(1000, AnalysisKind::Quick, true, 100, None, "basic", Some(3300.0))
            .unwrap();
        store
            .insert_analysis_log(1000, AnalysisKind::Quick, false, 200, Some("boom"), "basic", None)
            .unwrap();

        let (successful, total, mean_ms) = store.logs_stats_since(far_past).unwrap();
        assert_eq!(total, 2);
        assert_eq!(successful, 1);
        assert!((mean_ms - 150.0).abs() < 1e-9);
    }

    #[test]
    fn count_logs_on_date_matches_todays_inserts() {
        let (store, _f) = temp_store();
        store
            .insert_analysis_log(1000, AnalysisKind::Quick, true, 10, None, "basic", None)
            .unwrap();
        let count = store.count_logs_on_date(Utc::now().date_naive()).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn list_logs_filters_by_user_and_paginates() {
        let (store, _f) = temp_store();
        for i in 0..3 {
            store
                .insert_analysis_log(1000, AnalysisKind::Quick, true, 10 + i, None, "basic", Some(3300.0))
                .unwrap();
        }
        store
            .insert_analysis_log(2000, AnalysisKind::Quick, true, 10, None, "basic", Some(3300.0))
            .unwrap();

        let (logs, total) = store.list_logs(1, 10, Some(1000)).unwrap();
        assert_eq!(total, 3);
        assert_eq!(logs.len(), 3);
    }
}
