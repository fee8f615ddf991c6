//! Registration, login, password hashing, and quota bookkeeping. The
//! teacher's `auth/` module wires JWT bearer tokens and role-based access
//! around a Web3 wallet identity; none of that survives here, since the
//! analysis service gates access by a password sent with every request
//! against a numeric user id, not a session token. What's kept is the
//! shape: a thin struct wrapping [`crate::store::Store`], returning public
//! DTOs that never leak `password_hash`, exactly as `UserStore` never
//! leaks it in `UserResponse::from_user`.

use chrono::NaiveDate;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::clock::Clock;
use crate::store::{Store, Tier, UserRecord, UserStatus};

const SALT_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    InvalidEmail,
    EmailTaken,
    WeakPassword,
    UnknownEmail,
    BadPassword,
    Inactive,
    UserNotFound,
    DailyExhausted,
}

impl AuthError {
    /// Arabic-locale message surfaced to the end user, per the uniform
    /// response envelope (`{success:false, error: ...}`).
    pub fn message_ar(&self) -> &'static str {
        match self {
            AuthError::InvalidEmail => "صيغة البريد الإلكتروني غير صحيحة",
            AuthError::EmailTaken => "هذا البريد الإلكتروني مستخدم بالفعل",
            AuthError::WeakPassword => "كلمة المرور يجب أن تحتوي على 6 أحرف على الأقل وحرف ورقم",
            AuthError::UnknownEmail => "البريد الإلكتروني غير مسجل",
            AuthError::BadPassword => "كلمة المرور غير صحيحة",
            AuthError::Inactive => "الحساب غير نشط",
            AuthError::UserNotFound => "المستخدم غير موجود",
            AuthError::DailyExhausted => {
                "لقد استنفدت حصة التحليل المجاني اليوم، يرجى المحاولة غداً أو الترقية للاشتراك المميز"
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UserProjection {
    pub user_id: i64,
    pub email: String,
    pub display_name: Option<String>,
    pub tier: Tier,
    pub status: UserStatus,
    pub remaining_today: i64,
}

impl UserProjection {
    fn from_record(user: &UserRecord, remaining_today: i64) -> Self {
        Self {
            user_id: user.user_id,
            email: user.email.clone(),
            display_name: user.display_name.clone(),
            tier: user.tier,
            status: user.status,
            remaining_today,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PermissionCheck {
    pub allowed: bool,
    pub reason: &'static str,
    pub remaining: i64,
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// A conservative RFC-5322 subset: `local@domain.tld`, no whitespace,
/// exactly one `@`, a dot somewhere after it.
fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && domain.contains('.')
        && !email.chars().any(char::is_whitespace)
        && email.matches('@').count() == 1
}

fn is_strong_password(password: &str) -> bool {
    password.len() >= 6
        && password.chars().any(|c| c.is_ascii_alphabetic())
        && password.chars().any(|c| c.is_ascii_digit())
}

fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt_hex = hex::encode(salt);
    let digest = digest_with_salt(password, &salt_hex);
    format!("{salt_hex}:{digest}")
}

fn digest_with_salt(password: &str, salt_hex: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(salt_hex.as_bytes());
    hex::encode(hasher.finalize())
}

fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Some((salt_hex, expected_digest)) = stored_hash.split_once(':') else {
        return false;
    };
    let actual_digest = digest_with_salt(password, salt_hex);
    actual_digest.as_bytes().ct_eq(expected_digest.as_bytes()).into()
}

/// `remaining_today` given a tier's limit and the user's lazily-reset daily
/// counter. `daily_date` is the date the counter was last touched; if it
/// doesn't match `today`, the counter reads as zero without a write.
fn remaining_today(tier: Tier, daily_date: NaiveDate, daily_count: i64, today: NaiveDate) -> i64 {
    let limit = tier.daily_limit();
    if limit < 0 {
        return -1;
    }
    if daily_date != today {
        return limit;
    }
    (limit - daily_count).max(0)
}

pub struct AuthEngine<'a> {
    store: &'a Store,
    clock: &'a dyn Clock,
}

impl<'a> AuthEngine<'a> {
    pub fn new(store: &'a Store, clock: &'a dyn Clock) -> Self {
        Self { store, clock }
    }

    pub fn register(
        &self,
        email: &str,
        password: &str,
        display_name: Option<String>,
    ) -> Result<UserProjection, AuthError> {
        let email = normalize_email(email);
        if !is_valid_email(&email) {
            return Err(AuthError::InvalidEmail);
        }
        if !is_strong_password(password) {
            return Err(AuthError::WeakPassword);
        }
        if self
            .store
            .find_user_by_email(&email)
            .unwrap_or(None)
            .is_some()
        {
            return Err(AuthError::EmailTaken);
        }

        let now = self.clock.now();
        let user = UserRecord {
            user_id: self.store.next_user_id().unwrap_or(1000),
            email,
            password_hash: hash_password(password),
            display_name,
            tier: Tier::Basic,
            status: UserStatus::Active,
            total_analyses: 0,
            daily_date: now.date_naive(),
            daily_count: 0,
            subscription_start: now,
            subscription_end: None,
            last_seen: None,
            created_at: now,
        };

        self.store.insert_user(&user).map_err(|_| AuthError::EmailTaken)?;
        Ok(UserProjection::from_record(&user, user.tier.daily_limit()))
    }

    pub fn login(&self, email: &str, password: &str) -> Result<UserProjection, AuthError> {
        let email = normalize_email(email);
        let mut user = self
            .store
            .find_user_by_email(&email)
            .unwrap_or(None)
            .ok_or(AuthError::UnknownEmail)?;

        if !verify_password(password, &user.password_hash) {
            return Err(AuthError::BadPassword);
        }
        if user.status != UserStatus::Active {
            return Err(AuthError::Inactive);
        }

        user.last_seen = Some(self.clock.now());
        let _ = self.store.replace_user(&user);

        let today = self.clock.today();
        let remaining = remaining_today(user.tier, user.daily_date, user.daily_count, today);
        Ok(UserProjection::from_record(&user, remaining))
    }

    pub fn can_analyze(&self, user_id: i64) -> PermissionCheck {
        let Some(user) = self.store.find_user_by_id(user_id).unwrap_or(None) else {
            return PermissionCheck {
                allowed: false,
                reason: "user-not-found",
                remaining: 0,
            };
        };
        if user.status != UserStatus::Active {
            return PermissionCheck {
                allowed: false,
                reason: "inactive",
                remaining: 0,
            };
        }

        let today = self.clock.today();
        let remaining = remaining_today(user.tier, user.daily_date, user.daily_count, today);
        if remaining == 0 {
            return PermissionCheck {
                allowed: false,
                reason: "daily-exhausted",
                remaining: 0,
            };
        }
        PermissionCheck {
            allowed: true,
            reason: "ok",
            remaining,
        }
    }

    /// Bumps the daily and lifetime counters via a compare-and-swap against
    /// the `daily_date`/`daily_count` this call observes: [`Store::try_update_quota`]'s
    /// `WHERE daily_date = ... AND daily_count = ...` clause only lands if
    /// nobody else has written the row since. If a concurrent call for the
    /// same user wins the race, this retries against the now-current row,
    /// where the permission check correctly sees the slot as taken —
    /// realizing the per-user exclusive section from the concurrency model
    /// without holding a lock across the read and the write.
    pub fn record_analysis(&self, user_id: i64) -> Result<(), AuthError> {
        const MAX_ATTEMPTS: u32 = 8;

        for _ in 0..MAX_ATTEMPTS {
            let user = self
                .store
                .find_user_by_id(user_id)
                .unwrap_or(None)
                .ok_or(AuthError::UserNotFound)?;

            if user.status != UserStatus::Active {
                return Err(AuthError::Inactive);
            }

            let today = self.clock.today();
            let remaining = remaining_today(user.tier, user.daily_date, user.daily_count, today);
            if remaining == 0 {
                return Err(AuthError::DailyExhausted);
            }

            let (new_daily_date, new_daily_count) = if user.daily_date != today {
                (today, 1)
            } else {
                (user.daily_date, user.daily_count + 1)
            };
            let new_total = user.total_analyses + 1;

            let landed = self
                .store
                .try_update_quota(
                    user_id,
                    user.daily_date,
                    user.daily_count,
                    new_daily_date,
                    new_daily_count,
                    new_total,
                )
                .map_err(|_| AuthError::UserNotFound)?;

            if landed {
                return Ok(());
            }
            // Lost the CAS race against a concurrent writer; loop back and
            // re-read the row, which now reflects that writer's update.
        }

        Err(AuthError::DailyExhausted)
    }

    pub fn update_tier(&self, user_id: i64, new_tier: Tier) -> Result<(), AuthError> {
        let mut user = self
            .store
            .find_user_by_id(user_id)
            .unwrap_or(None)
            .ok_or(AuthError::UserNotFound)?;

        let now = self.clock.now();
        user.tier = new_tier;
        user.subscription_start = now;
        user.subscription_end = Some(now + chrono::Duration::days(365));
        user.daily_count = 0;
        user.daily_date = self.clock.today();

        self.store.replace_user(&user).map_err(|_| AuthError::UserNotFound)
    }

    pub fn toggle_status(&self, user_id: i64) -> Result<UserStatus, AuthError> {
        let mut user = self
            .store
            .find_user_by_id(user_id)
            .unwrap_or(None)
            .ok_or(AuthError::UserNotFound)?;

        user.status = match user.status {
            UserStatus::Active => UserStatus::Inactive,
            UserStatus::Inactive => UserStatus::Active,
            blocked_or_suspended => return Ok(blocked_or_suspended),
        };
        self.store
            .replace_user(&user)
            .map_err(|_| AuthError::UserNotFound)?;
        Ok(user.status)
    }
}
