use std::{fs, path::PathBuf, time::Duration};

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use sqlx::Executor;

use crate::{auth, conf};

const MIGRATIONS: [&str; 1] = [include_str!("../migrations/0_data.sql")];

/// Every registration attaches this plan; the migration seeds it.
pub const DEFAULT_PLAN_NAME: &str = "Free";

type Tx<'a> = sqlx::Transaction<'a, sqlx::Sqlite>;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_active: bool,
    pub is_staff: bool,
    pub is_superuser: bool,
    pub date_joined: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub plan_id: i64,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct Plan {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub query_limit: i64,
    pub query_window_hours: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct Profile {
    pub id: i64,
    pub user_id: i64,
    pub time_zone: Option<String>,
    pub language: String,
    pub preferences: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct UsageEntry {
    pub id: i64,
    pub user_id: i64,
    pub main_call_id: String,
    pub node_call_id: String,
    pub model: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Always recomputed by summing matching rows. No running counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageTotals {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub count: i64,
}

/// One node-level model invocation, as reported by the orchestrator.
#[derive(Debug, Clone)]
pub struct UsageSample {
    pub user_id: i64,
    pub main_call_id: String,
    pub node_call_id: String,
    pub model: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    pub allowed: bool,
    pub used: i64,
    pub remaining: i64,
    pub limit: i64,
    pub window_hours: i64,
}

pub struct NewUser<'a> {
    pub username: &'a str,
    pub email: &'a str,
    pub password_hash: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

pub struct NewPlan<'a> {
    pub name: &'a str,
    pub description: Option<String>,
    pub query_limit: i64,
    pub query_window_hours: i64,
    pub is_active: bool,
}

#[derive(Debug, Default)]
pub struct UserUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Default)]
pub struct PlanUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub query_limit: Option<i64>,
    pub query_window_hours: Option<i64>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Default)]
pub struct ProfileUpdate {
    pub time_zone: Option<String>,
    pub language: Option<String>,
    pub preferences: Option<String>,
}

#[derive(Clone)]
pub struct Storage {
    pool: sqlx::Pool<sqlx::Sqlite>,
}

impl Storage {
    pub async fn connect() -> anyhow::Result<Self> {
        let busy_timeout =
            Duration::from_secs_f32(conf::global().sqlite_busy_timeout);
        Self::connect_at(PathBuf::from("data/data.db"), busy_timeout).await
    }

    pub async fn connect_at(
        file_path: PathBuf,
        busy_timeout: Duration,
    ) -> anyhow::Result<Self> {
        if let Some(parent) = file_path.parent() {
            let ctx = format!(
                "Failed to create parent directory \
                for database file: {file_path:?}"
            );
            fs::create_dir_all(parent).context(ctx)?;
        }
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(file_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout)
            .foreign_keys(true);
        let pool = sqlx::SqlitePool::connect_with(options).await?;
        let selph = Self { pool };
        for migration in MIGRATIONS {
            selph.pool.execute(migration).await?;
        }
        Ok(selph)
    }

    pub(crate) fn pool(&self) -> sqlx::Pool<sqlx::Sqlite> {
        self.pool.clone()
    }

    // ------------------------------------------------------------- users --

    /// Registers a user on the default plan and creates its profile row.
    pub async fn create_user(&self, new: NewUser<'_>) -> anyhow::Result<User> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let plan: Option<Plan> = sqlx::query_as(
            "SELECT * FROM plans WHERE name = ? AND is_active = 1",
        )
        .bind(DEFAULT_PLAN_NAME)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(plan) = plan else {
            bail!(
                "Default plan {DEFAULT_PLAN_NAME:?} is missing. \
                Refusing to register users."
            )
        };
        let user_id = sqlx::query(
            "INSERT INTO users
                (username, email, password, first_name, last_name,
                 is_active, is_staff, is_superuser, date_joined, plan_id)
                VALUES (?, ?, ?, ?, ?, 1, 0, 0, ?, ?)",
        )
        .bind(new.username)
        .bind(new.email)
        .bind(&new.password_hash)
        .bind(&new.first_name)
        .bind(&new.last_name)
        .bind(now)
        .bind(plan.id)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
        sqlx::query(
            "INSERT INTO profiles
                (user_id, language, is_active, created_at, updated_at)
                VALUES (?, 'en', 1, ?, ?)",
        )
        .bind(user_id)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        self.user_by_id(user_id)
            .await?
            .context("Re-fetching a freshly inserted user")
    }

    pub async fn user_by_id(&self, id: i64) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn user_by_email(
        &self,
        email: &str,
    ) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn user_by_username(
        &self,
        username: &str,
    ) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    /// Checks credentials and the active flag; bumps `last_login` on success.
    pub async fn authenticate(
        &self,
        email: &str,
        password: &str,
    ) -> anyhow::Result<Option<User>> {
        let Some(user) = self.user_by_email(email).await? else {
            return Ok(None);
        };
        if !auth::verify_password(password, &user.password) {
            return Ok(None);
        }
        if !user.is_active {
            return Ok(None);
        }
        let now = Utc::now();
        sqlx::query("UPDATE users SET last_login = ? WHERE id = ?")
            .bind(now)
            .bind(user.id)
            .execute(&self.pool)
            .await?;
        Ok(Some(User {
            last_login: Some(now),
            ..user
        }))
    }

    pub async fn set_password(
        &self,
        user_id: i64,
        password_hash: &str,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE users SET password = ? WHERE id = ?")
            .bind(password_hash)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_user(
        &self,
        user_id: i64,
        update: UserUpdate,
    ) -> anyhow::Result<Option<User>> {
        let Some(user) = self.user_by_id(user_id).await? else {
            return Ok(None);
        };
        let first_name = update.first_name.or(user.first_name);
        let last_name = update.last_name.or(user.last_name);
        let is_active = update.is_active.unwrap_or(user.is_active);
        sqlx::query(
            "UPDATE users SET first_name = ?, last_name = ?, is_active = ?
                WHERE id = ?",
        )
        .bind(&first_name)
        .bind(&last_name)
        .bind(is_active)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        self.user_by_id(user_id).await
    }

    pub async fn set_user_active(
        &self,
        user_id: i64,
        is_active: bool,
    ) -> anyhow::Result<Option<User>> {
        self.update_user(
            user_id,
            UserUpdate {
                is_active: Some(is_active),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn set_user_plan(
        &self,
        user_id: i64,
        plan_id: i64,
    ) -> anyhow::Result<Option<User>> {
        if self.plan_by_id(plan_id).await?.is_none() {
            return Ok(None);
        }
        let result = sqlx::query("UPDATE users SET plan_id = ? WHERE id = ?")
            .bind(plan_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.user_by_id(user_id).await
    }

    // ------------------------------------------------------------- plans --

    pub async fn plan_by_id(&self, id: i64) -> anyhow::Result<Option<Plan>> {
        let plan = sqlx::query_as("SELECT * FROM plans WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(plan)
    }

    pub async fn plan_by_name(
        &self,
        name: &str,
    ) -> anyhow::Result<Option<Plan>> {
        let plan = sqlx::query_as("SELECT * FROM plans WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(plan)
    }

    pub async fn plans(
        &self,
        include_inactive: bool,
    ) -> anyhow::Result<Vec<Plan>> {
        let plans = if include_inactive {
            sqlx::query_as("SELECT * FROM plans ORDER BY query_limit")
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query_as(
                "SELECT * FROM plans WHERE is_active = 1
                    ORDER BY query_limit",
            )
            .fetch_all(&self.pool)
            .await?
        };
        Ok(plans)
    }

    pub async fn create_plan(&self, new: NewPlan<'_>) -> anyhow::Result<Plan> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO plans
                (name, description, query_limit, query_window_hours,
                 is_active, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new.name)
        .bind(&new.description)
        .bind(new.query_limit)
        .bind(new.query_window_hours)
        .bind(new.is_active)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        self.plan_by_id(id)
            .await?
            .context("Re-fetching a freshly inserted plan")
    }

    pub async fn update_plan(
        &self,
        plan_id: i64,
        update: PlanUpdate,
    ) -> anyhow::Result<Option<Plan>> {
        let Some(plan) = self.plan_by_id(plan_id).await? else {
            return Ok(None);
        };
        let name = update.name.unwrap_or(plan.name);
        let description = update.description.or(plan.description);
        let query_limit = update.query_limit.unwrap_or(plan.query_limit);
        let query_window_hours =
            update.query_window_hours.unwrap_or(plan.query_window_hours);
        let is_active = update.is_active.unwrap_or(plan.is_active);
        sqlx::query(
            "UPDATE plans SET
                name = ?, description = ?, query_limit = ?,
                query_window_hours = ?, is_active = ?, updated_at = ?
                WHERE id = ?",
        )
        .bind(&name)
        .bind(&description)
        .bind(query_limit)
        .bind(query_window_hours)
        .bind(is_active)
        .bind(Utc::now())
        .bind(plan_id)
        .execute(&self.pool)
        .await?;
        self.plan_by_id(plan_id).await
    }

    // ---------------------------------------------------------- profiles --

    pub async fn profile_for_user(
        &self,
        user_id: i64,
    ) -> anyhow::Result<Option<Profile>> {
        let profile =
            sqlx::query_as("SELECT * FROM profiles WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(profile)
    }

    pub async fn update_profile(
        &self,
        user_id: i64,
        update: ProfileUpdate,
    ) -> anyhow::Result<Option<Profile>> {
        let Some(profile) = self.profile_for_user(user_id).await? else {
            return Ok(None);
        };
        let time_zone = update.time_zone.or(profile.time_zone);
        let language = update.language.unwrap_or(profile.language);
        let preferences = update.preferences.or(profile.preferences);
        sqlx::query(
            "UPDATE profiles SET
                time_zone = ?, language = ?, preferences = ?, updated_at = ?
                WHERE user_id = ?",
        )
        .bind(&time_zone)
        .bind(&language)
        .bind(&preferences)
        .bind(Utc::now())
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        self.profile_for_user(user_id).await
    }

    // ------------------------------------------------------ usage ledger --

    /// Appends one ledger row. Rows are never updated afterwards.
    pub async fn record_usage(
        &self,
        sample: &UsageSample,
    ) -> anyhow::Result<i64> {
        let id = sqlx::query(
            "INSERT INTO usage_logs
                (user_id, main_call_id, node_call_id, model,
                 input_tokens, output_tokens, total_tokens, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(sample.user_id)
        .bind(&sample.main_call_id)
        .bind(&sample.node_call_id)
        .bind(&sample.model)
        .bind(sample.input_tokens)
        .bind(sample.output_tokens)
        .bind(sample.total_tokens)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn usage_entries(
        &self,
        user_id: i64,
        model: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<UsageEntry>> {
        let entries = match model {
            None => {
                sqlx::query_as(
                    "SELECT * FROM usage_logs WHERE user_id = ?
                        ORDER BY created_at DESC, id DESC
                        LIMIT ? OFFSET ?",
                )
                .bind(user_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            Some(model) => {
                sqlx::query_as(
                    "SELECT * FROM usage_logs
                        WHERE user_id = ? AND model = ?
                        ORDER BY created_at DESC, id DESC
                        LIMIT ? OFFSET ?",
                )
                .bind(user_id)
                .bind(model)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(entries)
    }

    pub async fn usage_totals(
        &self,
        user_id: i64,
        model: Option<&str>,
    ) -> anyhow::Result<UsageTotals> {
        let (input_tokens, output_tokens, total_tokens, count): (
            i64,
            i64,
            i64,
            i64,
        ) = match model {
            None => {
                sqlx::query_as(
                    "SELECT
                        COALESCE(SUM(input_tokens), 0),
                        COALESCE(SUM(output_tokens), 0),
                        COALESCE(SUM(total_tokens), 0),
                        COUNT(*)
                        FROM usage_logs WHERE user_id = ?",
                )
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?
            }
            Some(model) => {
                sqlx::query_as(
                    "SELECT
                        COALESCE(SUM(input_tokens), 0),
                        COALESCE(SUM(output_tokens), 0),
                        COALESCE(SUM(total_tokens), 0),
                        COUNT(*)
                        FROM usage_logs WHERE user_id = ? AND model = ?",
                )
                .bind(user_id)
                .bind(model)
                .fetch_one(&self.pool)
                .await?
            }
        };
        Ok(UsageTotals {
            input_tokens,
            output_tokens,
            total_tokens,
            count,
        })
    }

    /// Retention purge. The only path that deletes ledger rows.
    pub async fn purge_usage_older_than(
        &self,
        days: i64,
    ) -> anyhow::Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let result =
            sqlx::query("DELETE FROM usage_logs WHERE created_at < ?")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------ rate limiter --

    pub async fn rate_limit_check(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<RateLimit> {
        let tx = self.pool.begin().await?;
        let (tx, check) = rate_limit_check(tx, user_id, now).await?;
        tx.commit().await?;
        Ok(check)
    }
}

#[derive(sqlx::FromRow)]
struct PlanLimitsRow {
    query_limit: i64,
    query_window_hours: i64,
}

/// Fixed sliding window recomputed from the ledger on every check.
/// A missing or misconfigured plan rejects; there is no permissive fallback.
async fn rate_limit_check<'a>(
    mut tx: Tx<'a>,
    user_id: i64,
    now: DateTime<Utc>,
) -> anyhow::Result<(Tx<'a>, RateLimit)> {
    let limits: Option<PlanLimitsRow> = sqlx::query_as(
        "SELECT p.query_limit, p.query_window_hours
            FROM users u JOIN plans p ON p.id = u.plan_id
            WHERE u.id = ?",
    )
    .bind(user_id)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(PlanLimitsRow {
        query_limit,
        query_window_hours,
    }) = limits
    else {
        let check = RateLimit {
            allowed: false,
            used: 0,
            remaining: 0,
            limit: 0,
            window_hours: 0,
        };
        return Ok((tx, check));
    };
    if query_limit <= 0 || query_window_hours <= 0 {
        let check = RateLimit {
            allowed: false,
            used: 0,
            remaining: 0,
            limit: query_limit,
            window_hours: query_window_hours,
        };
        return Ok((tx, check));
    }
    let cutoff = now - chrono::Duration::hours(query_window_hours);
    // One user-facing request may write several node-level rows; they share
    // a main_call_id and count as ONE query.
    let used: i64 = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT main_call_id) FROM usage_logs
            WHERE user_id = ? AND created_at >= ?",
    )
    .bind(user_id)
    .bind(cutoff)
    .fetch_one(&mut *tx)
    .await?;
    let check = RateLimit {
        allowed: used < query_limit,
        used,
        remaining: (query_limit - used).max(0),
        limit: query_limit,
        window_hours: query_window_hours,
    };
    Ok((tx, check))
}
