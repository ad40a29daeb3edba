use utoipa::openapi::security::HttpAuthScheme;
use utoipa::OpenApi;

use crate::types::{
    LoginReq, MessageReq, PasswordChangeReq, PlanAssignReq, PlanCreateReq,
    PlanRead, PlanUpdateReq, ProfileRead, ProfileUpdateReq, RateLimited,
    RegisterReq, TokenResponse, UsageLogRead, UsageStatus, UsageTotalsRead,
    UserRead, UserUpdateReq,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::server::handle_register,
        crate::server::handle_login,
        crate::server::handle_refresh,
        crate::server::handle_me,
        crate::server::handle_me_update,
        crate::server::handle_change_password,
        crate::server::handle_assign_plan,
        crate::server::handle_profile,
        crate::server::handle_profile_update,
        crate::server::handle_plans,
        crate::server::handle_plan_create,
        crate::server::handle_plan_update,
        crate::server::handle_chat,
        crate::server::handle_chat_stream,
        crate::server::handle_usage,
        crate::server::handle_usage_logs,
        crate::server::handle_usage_totals,
    ),
    components(
        schemas(
            RegisterReq,
            LoginReq,
            TokenResponse,
            PasswordChangeReq,
            UserUpdateReq,
            UserRead,
            ProfileRead,
            ProfileUpdateReq,
            PlanRead,
            PlanCreateReq,
            PlanUpdateReq,
            PlanAssignReq,
            MessageReq,
            UsageStatus,
            RateLimited,
            UsageLogRead,
            UsageTotalsRead
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "kvota", description = "Kvota API endpoints")
    ),
    info(
        title = "Kvota API",
        version = "1.0",
        description = "JWT-gated LLM chat API with plan-based query metering",
        license(
            name = "BSD-3-Clause"
        )
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "jwt",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}
