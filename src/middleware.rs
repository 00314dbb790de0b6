use axum::{extract::FromRequestParts, http::request::Parts};
use data_model::ShareAccess;
use vault_utils::get_epoch_time_in_ms;

use crate::http_objects::ApiError;

/// Caller identity taken from the gateway-provided headers. The server
/// trusts these values; authenticating them is the gateway's job.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant_id: String,
    pub user_id: String,
}

impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant_id = header_value(parts, "x-tenant-id")
            .ok_or_else(|| ApiError::unauthorized("missing X-Tenant-Id header"))?;
        let user_id = header_value(parts, "x-user-id")
            .ok_or_else(|| ApiError::unauthorized("missing X-User-Id header"))?;
        Ok(TenantContext { tenant_id, user_id })
    }
}

/// Best-effort client details for share access logs. Never rejects.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub ip: String,
    pub user_agent: String,
}

impl ClientInfo {
    pub fn access(&self, action: data_model::ShareAccessAction) -> ShareAccess {
        ShareAccess {
            ip: self.ip.clone(),
            user_agent: self.user_agent.clone(),
            at: get_epoch_time_in_ms(),
            action,
        }
    }
}

impl<S> FromRequestParts<S> for ClientInfo
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ip = header_value(parts, "x-forwarded-for")
            .map(|v| v.split(',').next().unwrap_or("").trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        let user_agent = header_value(parts, "user-agent").unwrap_or_default();
        Ok(ClientInfo { ip, user_agent })
    }
}

fn header_value(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .filter(|v| !v.is_empty())
}
