use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;

use crate::activity_pub::repo::{Account, AccountRepo};
use crate::error::ApiError;

pub(super) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Resolve the optional bearer credential. No header means an anonymous
/// viewer; a header that names no account is a 401.
pub(super) fn viewer_account(
    headers: &HeaderMap,
    accounts: &AccountRepo,
) -> Result<Option<Account>, ApiError> {
    let Some(token) = bearer_token(headers) else {
        return Ok(None);
    };
    let account = accounts.find_by_token(token)?.ok_or(ApiError::Unauthorized)?;
    Ok(Some(account))
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderMap;

    use super::bearer_token;

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert("authorization", "Bearer  abc123 ".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc123"));
        headers.insert("authorization", "Basic abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
