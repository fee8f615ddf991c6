use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::Serialize;
use uuid::Uuid;

use super::Store;

/// One admin action: a tier change, status toggle, or other mutation made
/// through the admin surface. Kept in its own table rather than folded into
/// `analysis_logs` with placeholder analysis fields, which is what the
/// source does for its equivalent trail.
#[derive(Debug, Clone, Serialize)]
pub struct AdminAuditEntry {
    pub id: String,
    pub admin_id: String,
    pub action: String,
    pub target_user_id: Option<i64>,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn row_to_entry(row: &Row) -> rusqlite::Result<AdminAuditEntry> {
    let created_at_raw: String = row.get("created_at")?;
    Ok(AdminAuditEntry {
        id: row.get("id")?,
        admin_id: row.get("admin_id")?,
        action: row.get("action")?,
        target_user_id: row.get("target_user_id")?,
        detail: row.get("detail")?,
        created_at: DateTime::parse_from_rfc3339(&created_at_raw)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

impl Store {
    pub fn insert_admin_audit_entry(
        &self,
        admin_id: &str,
        action: &str,
        target_user_id: Option<i64>,
        detail: Option<&str>,
    ) -> Result<String> {
        let conn = self.conn()?;
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO admin_audit (id, admin_id, action, target_user_id, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                admin_id,
                action,
                target_user_id,
                detail,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("inserting admin audit entry")?;
        Ok(id)
    }

    pub fn list_admin_audit(&self, page: u32, per_page: u32) -> Result<(Vec<AdminAuditEntry>, i64)> {
        let conn = self.conn()?;
        let total: i64 = conn
            .query_row("SELECT COUNT(*) FROM admin_audit", [], |r| r.get(0))
            .context("counting admin audit entries")?;

        let offset = (page.saturating_sub(1)) as i64 * per_page as i64;
        let mut stmt = conn.prepare(
            "SELECT * FROM admin_audit ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(params![per_page as i64, offset], row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((rows, total))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::temp_store;

    #[test]
    fn insert_then_list_admin_audit_entries() {
        let (store, _f) = temp_store();
        store
            .insert_admin_audit_entry("admin", "tier_change", Some(1000), Some("basic -> vip"))
            .unwrap();
        store
            .insert_admin_audit_entry("admin", "status_toggle", Some(1001), None)
            .unwrap();

        let (entries, total) = store.list_admin_audit(1, 10).unwrap();
        assert_eq!(total, 2);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "status_toggle");
    }
}
