use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Basic,
    Premium,
    Vip,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Basic => "basic",
            Tier::Premium => "premium",
            Tier::Vip => "vip",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "basic" => Some(Tier::Basic),
            "premium" => Some(Tier::Premium),
            "vip" => Some(Tier::Vip),
            _ => None,
        }
    }

    /// Daily analysis quota; -1 is the unlimited sentinel.
    pub fn daily_limit(&self) -> i64 {
        match self {
            Tier::Basic => 1,
            Tier::Premium => 5,
            Tier::Vip => -1,
        }
    }

    pub fn save_history(&self) -> bool {
        !matches!(self, Tier::Basic)
    }

    pub fn priority_support(&self) -> bool {
        matches!(self, Tier::Vip)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Inactive,
    Blocked,
    Suspended,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Inactive => "inactive",
            UserStatus::Blocked => "blocked",
            UserStatus::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(UserStatus::Active),
            "inactive" => Some(UserStatus::Inactive),
            "blocked" => Some(UserStatus::Blocked),
            "suspended" => Some(UserStatus::Suspended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    pub user_id: i64,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub display_name: Option<String>,
    pub tier: Tier,
    pub status: UserStatus,
    pub total_analyses: i64,
    pub daily_date: NaiveDate,
    pub daily_count: i64,
    pub subscription_start: DateTime<Utc>,
    pub subscription_end: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn row_to_user(row: &Row) -> rusqlite::Result<UserRecord> {
    let tier_raw: String = row.get("tier")?;
    let status_raw: String = row.get("status")?;
    let daily_date_raw: String = row.get("daily_date")?;
    let subscription_start_raw: String = row.get("subscription_start")?;
    let subscription_end_raw: Option<String> = row.get("subscription_end")?;
    let last_seen_raw: Option<String> = row.get("last_seen")?;
    let created_at_raw: String = row.get("created_at")?;

    Ok(UserRecord {
        user_id: row.get("user_id")?,
        email: row.get("email")?,
        password_hash: row.get("password_hash")?,
        display_name: row.get("display_name")?,
        tier: Tier::parse(&tier_raw).unwrap_or(Tier::Basic),
        status: UserStatus::parse(&status_raw).unwrap_or(UserStatus::Inactive),
        total_analyses: row.get("total_analyses")?,
        daily_date: NaiveDate::parse_from_str(&daily_date_raw, "%Y-%m-%d")
            .unwrap_or_else(|_| Utc::now().date_naive()),
        daily_count: row.get("daily_count")?,
        subscription_start: DateTime::parse_from_rfc3339(&subscription_start_raw)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        subscription_end: subscription_end_raw.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }),
        last_seen: last_seen_raw.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }),
        created_at: DateTime::parse_from_rfc3339(&created_at_raw)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

impl Store {
    /// Next monotonic user id, floored at 1000 per the data model invariant.
    pub fn next_user_id(&self) -> Result<i64> {
        let conn = self.conn()?;
        let max: Option<i64> = conn
            .query_row("SELECT MAX(user_id) FROM users", [], |r| r.get(0))
            .context("reading max user_id")?;
        Ok(max.unwrap_or(999).max(999) + 1)
    }

    pub fn insert_user(&self, user: &UserRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (
                user_id, email, password_hash, display_name, tier, status,
                total_analyses, daily_date, daily_count,
                subscription_start, subscription_end, last_seen, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                user.user_id,
                user.email,
                user.password_hash,
                user.display_name,
                user.tier.as_str(),
                user.status.as_str(),
                user.total_analyses,
                user.daily_date.format("%Y-%m-%d").to_string(),
                user.daily_count,
                user.subscription_start.to_rfc3339(),
                user.subscription_end.map(|d| d.to_rfc3339()),
                user.last_seen.map(|d| d.to_rfc3339()),
                user.created_at.to_rfc3339(),
            ],
        )
        .context("inserting user")?;
        Ok(())
    }

    pub fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM users WHERE email = ?1",
            params![email],
            row_to_user,
        )
        .optional()
        .context("finding user by email")
    }

    pub fn find_user_by_id(&self, user_id: i64) -> Result<Option<UserRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM users WHERE user_id = ?1",
            params![user_id],
            row_to_user,
        )
        .optional()
        .context("finding user by id")
    }

    pub fn replace_user(&self, user: &UserRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE users SET
                email = ?2, password_hash = ?3, display_name = ?4, tier = ?5,
                status = ?6, total_analyses = ?7, daily_date = ?8, daily_count = ?9,
                subscription_start = ?10, subscription_end = ?11, last_seen = ?12
             WHERE user_id = ?1",
            params![
                user.user_id,
                user.email,
                user.password_hash,
                user.display_name,
                user.tier.as_str(),
                user.status.as_str(),
                user.total_analyses,
                user.daily_date.format("%Y-%m-%d").to_string(),
                user.daily_count,
                user.subscription_start.to_rfc3339(),
                user.subscription_end.map(|d| d.to_rfc3339()),
                user.last_seen.map(|d| d.to_rfc3339()),
            ],
        )
        .context("replacing user")?;
        Ok(())
    }

    /// Conditionally bumps the quota counters, succeeding only if the row's
    /// `daily_date`/`daily_count` still match what the caller read before
    /// computing the new values. Returns `false` (no row touched) if a
    /// concurrent writer already changed them, so the caller can re-read and
    /// retry instead of overwriting a sibling update. This is the
    /// conditional-update half of spec §5's per-user exclusive section: the
    /// `WHERE` clause on the old values makes the read-modify-write
    /// linearisable without holding any lock across the two queries.
    pub fn try_update_quota(
        &self,
        user_id: i64,
        expected_daily_date: NaiveDate,
        expected_daily_count: i64,
        new_daily_date: NaiveDate,
        new_daily_count: i64,
        new_total_analyses: i64,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let affected = conn
            .execute(
                "UPDATE users SET daily_date = ?1, daily_count = ?2, total_analyses = ?3
                 WHERE user_id = ?4 AND daily_date = ?5 AND daily_count = ?6",
                params![
                    new_daily_date.format("%Y-%m-%d").to_string(),
                    new_daily_count,
                    new_total_analyses,
                    user_id,
                    expected_daily_date.format("%Y-%m-%d").to_string(),
                    expected_daily_count,
                ],
            )
            .context("conditionally updating quota")?;
        Ok(affected == 1)
    }

    /// `(basic, premium, vip)` counts, for the admin dashboard's tier
    /// breakdown.
    pub fn count_users_by_tier(&self) -> Result<(i64, i64, i64)> {
        let conn = self.conn()?;
        let mut count = |tier: Tier| -> Result<i64> {
            conn.query_row(
                "SELECT COUNT(*) FROM users WHERE tier = ?1",
                params![tier.as_str()],
                |r| r.get(0),
            )
            .context("counting users by tier")
        };
        Ok((count(Tier::Basic)?, count(Tier::Premium)?, count(Tier::Vip)?))
    }

    /// Sum of every user's lifetime analysis counter, used for the
    /// dashboard's all-time total.
    pub fn total_analyses_lifetime(&self) -> Result<i64> {
        let conn = self.conn()?;
        let total: Option<i64> = conn
            .query_row("SELECT SUM(total_analyses) FROM users", [], |r| r.get(0))
            .context("summing lifetime analyses")?;
        Ok(total.unwrap_or(0))
    }

    pub fn list_users(&self, page: u32, per_page: u32) -> Result<(Vec<UserRecord>, i64)> {
        let conn = self.conn()?;
        let total: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
            .context("counting users")?;

        let offset = (page.saturating_sub(1)) as i64 * per_page as i64;
        let mut stmt = conn
            .prepare("SELECT * FROM users ORDER BY user_id ASC LIMIT ?1 OFFSET ?2")
            .context("preparing list_users query")?;
        let rows = stmt
            .query_map(params![per_page as i64, offset], row_to_user)
            .context("listing users")?;
        let users = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((users, total))
    }
}
