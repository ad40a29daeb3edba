use chrono::{DateTime, Utc};
use utoipa::ToSchema;

use crate::data;

#[derive(serde::Deserialize, Debug, ToSchema)]
pub struct RegisterReq {
    pub username: String,
    pub email: String,
    pub password: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(serde::Deserialize, Debug, ToSchema)]
pub struct LoginReq {
    pub email: String,
    pub password: String,
}

#[derive(serde::Serialize, Debug, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
}

impl TokenResponse {
    pub fn bearer(access_token: String) -> Self {
        Self {
            access_token,
            token_type: "bearer".to_string(),
        }
    }
}

#[derive(serde::Deserialize, Debug, ToSchema)]
pub struct PasswordChangeReq {
    pub current_password: String,
    pub new_password: String,
}

#[derive(serde::Deserialize, Debug, ToSchema)]
pub struct UserUpdateReq {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_active: Option<bool>,
}

impl From<UserUpdateReq> for data::UserUpdate {
    fn from(req: UserUpdateReq) -> Self {
        Self {
            first_name: req.first_name,
            last_name: req.last_name,
            is_active: req.is_active,
        }
    }
}

#[derive(serde::Serialize, Debug, ToSchema)]
pub struct UserRead {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_active: bool,
    pub is_staff: bool,
    pub is_superuser: bool,
    pub date_joined: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub plan_id: i64,
}

impl From<data::User> for UserRead {
    fn from(user: data::User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
            is_active: user.is_active,
            is_staff: user.is_staff,
            is_superuser: user.is_superuser,
            date_joined: user.date_joined,
            last_login: user.last_login,
            plan_id: user.plan_id,
        }
    }
}

#[derive(serde::Serialize, Debug, ToSchema)]
pub struct ProfileRead {
    pub time_zone: Option<String>,
    pub language: String,
    pub preferences: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<data::Profile> for ProfileRead {
    fn from(profile: data::Profile) -> Self {
        Self {
            time_zone: profile.time_zone,
            language: profile.language,
            preferences: profile.preferences,
            is_active: profile.is_active,
            created_at: profile.created_at,
            updated_at: profile.updated_at,
        }
    }
}

#[derive(serde::Deserialize, Debug, ToSchema)]
pub struct ProfileUpdateReq {
    pub time_zone: Option<String>,
    pub language: Option<String>,
    pub preferences: Option<String>,
}

impl From<ProfileUpdateReq> for data::ProfileUpdate {
    fn from(req: ProfileUpdateReq) -> Self {
        Self {
            time_zone: req.time_zone,
            language: req.language,
            preferences: req.preferences,
        }
    }
}

#[derive(serde::Serialize, Debug, ToSchema)]
pub struct PlanRead {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub query_limit: i64,
    pub query_window_hours: i64,
    pub is_active: bool,
}

impl From<data::Plan> for PlanRead {
    fn from(plan: data::Plan) -> Self {
        Self {
            id: plan.id,
            name: plan.name,
            description: plan.description,
            query_limit: plan.query_limit,
            query_window_hours: plan.query_window_hours,
            is_active: plan.is_active,
        }
    }
}

#[derive(serde::Deserialize, Debug, ToSchema)]
pub struct PlanCreateReq {
    pub name: String,
    pub description: Option<String>,
    pub query_limit: i64,
    pub query_window_hours: i64,
    pub is_active: Option<bool>,
}

#[derive(serde::Deserialize, Debug, ToSchema)]
pub struct PlanUpdateReq {
    pub name: Option<String>,
    pub description: Option<String>,
    pub query_limit: Option<i64>,
    pub query_window_hours: Option<i64>,
    pub is_active: Option<bool>,
}

impl From<PlanUpdateReq> for data::PlanUpdate {
    fn from(req: PlanUpdateReq) -> Self {
        Self {
            name: req.name,
            description: req.description,
            query_limit: req.query_limit,
            query_window_hours: req.query_window_hours,
            is_active: req.is_active,
        }
    }
}

#[derive(serde::Deserialize, Debug, ToSchema)]
pub struct PlanAssignReq {
    pub plan_id: i64,
}

#[derive(serde::Deserialize, Debug, ToSchema)]
pub struct MessageReq {
    /// Query message for the chatbot.
    pub message: String,
}

#[derive(serde::Serialize, Debug, ToSchema)]
pub struct UsageStatus {
    pub used: i64,
    pub remaining: i64,
    pub limit: i64,
    pub window_hours: i64,
    pub can_query: bool,
}

impl From<data::RateLimit> for UsageStatus {
    fn from(check: data::RateLimit) -> Self {
        Self {
            used: check.used,
            remaining: check.remaining,
            limit: check.limit,
            window_hours: check.window_hours,
            can_query: check.allowed,
        }
    }
}

/// Body of a 429 response.
#[derive(serde::Serialize, Debug, ToSchema)]
pub struct RateLimited {
    pub message: String,
    pub queries_used: i64,
    pub queries_limit: i64,
    pub window_hours: i64,
    pub queries_remaining: i64,
}

#[derive(serde::Serialize, Debug, ToSchema)]
pub struct UsageLogRead {
    pub id: i64,
    pub main_call_id: String,
    pub node_call_id: String,
    pub model: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl From<data::UsageEntry> for UsageLogRead {
    fn from(entry: data::UsageEntry) -> Self {
        Self {
            id: entry.id,
            main_call_id: entry.main_call_id,
            node_call_id: entry.node_call_id,
            model: entry.model,
            input_tokens: entry.input_tokens,
            output_tokens: entry.output_tokens,
            total_tokens: entry.total_tokens,
            created_at: entry.created_at,
        }
    }
}

#[derive(serde::Serialize, Debug, ToSchema)]
pub struct UsageTotalsRead {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub count: i64,
}

impl From<data::UsageTotals> for UsageTotalsRead {
    fn from(totals: data::UsageTotals) -> Self {
        Self {
            input_tokens: totals.input_tokens,
            output_tokens: totals.output_tokens,
            total_tokens: totals.total_tokens,
            count: totals.count,
        }
    }
}
