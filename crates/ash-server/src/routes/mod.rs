pub mod agents;
pub mod health;
pub mod internal;
pub mod sessions;

use ash_core::ids::TenantId;
use axum::http::HeaderMap;

/// Every tenant-scoped route reads `X-Tenant-Id`, defaulting to `"default"`.
pub fn tenant_from_headers(headers: &HeaderMap) -> TenantId {
    headers
        .get("X-Tenant-Id")
        .and_then(|v| v.to_str().ok())
        .into()
}
