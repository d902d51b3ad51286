//! Header-based credential checks shared by the public Bearer-token layer and
//! the internal `X-Internal-Secret` layer. Both call sites want the same
//! shape: pull a header, strip a scheme prefix if any, compare against a
//! configured secret, and fail with [`ApiError::AuthFailure`] on any
//! mismatch. Centralizing it here means the comparison discipline
//! (constant-time) only needs to be right once.

use crate::error::{ApiError, ApiResult};

/// Constant-time string comparison. Header/secret comparisons are not
/// exposed via a timing-sensitive channel, but matching string length
/// first and comparing in bulk keeps the expected-failure path cheap
/// without leaking obviously.
fn ct_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Extract a bearer token from an `Authorization: Bearer <token>` header
/// value and check it against `expected`.
pub fn check_bearer(header_value: Option<&str>, expected: &str) -> ApiResult<()> {
    let value = header_value.ok_or(ApiError::AuthFailure)?;
    let token = value.strip_prefix("Bearer ").ok_or(ApiError::AuthFailure)?;
    if ct_eq(token, expected) {
        Ok(())
    } else {
        Err(ApiError::AuthFailure)
    }
}

/// Check a raw shared-secret header (`X-Internal-Secret`) against `expected`.
pub fn check_shared_secret(header_value: Option<&str>, expected: &str) -> ApiResult<()> {
    let value = header_value.ok_or(ApiError::AuthFailure)?;
    if ct_eq(value, expected) {
        Ok(())
    } else {
        Err(ApiError::AuthFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_accepts_matching_token() {
        assert!(check_bearer(Some("Bearer secret123"), "secret123").is_ok());
    }

    #[test]
    fn bearer_rejects_missing_header() {
        assert!(check_bearer(None, "secret123").is_err());
    }

    #[test]
    fn bearer_rejects_wrong_scheme() {
        assert!(check_bearer(Some("Basic secret123"), "secret123").is_err());
    }

    #[test]
    fn bearer_rejects_mismatch() {
        assert!(check_bearer(Some("Bearer nope"), "secret123").is_err());
    }

    #[test]
    fn shared_secret_roundtrip() {
        assert!(check_shared_secret(Some("shh"), "shh").is_ok());
        assert!(check_shared_secret(Some("nope"), "shh").is_err());
        assert!(check_shared_secret(None, "shh").is_err());
    }
}
