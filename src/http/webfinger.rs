use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::activity_pub::repo::AccountRepo;
use crate::error::ApiError;

use super::AppState;
use super::content_type::JrdJson;

#[derive(Debug, Deserialize)]
pub(super) struct WebFingerQuery {
    resource: String,
}

pub(super) async fn resolve(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<JrdJson, ApiError> {
    let acct = query
        .resource
        .strip_prefix("acct:")
        .ok_or_else(|| ApiError::bad_request("resource must be an acct: URI"))?;
    let (username, host) = acct
        .split_once('@')
        .ok_or_else(|| ApiError::bad_request("acct: URI must name user@host"))?;
    if host != state.config.init.host {
        return Err(ApiError::NotFound);
    }
    let accounts = AccountRepo::new(state.config.keyspace.clone())?;
    let account = accounts.find_by_username(username)?.ok_or(ApiError::NotFound)?;
    Ok(JrdJson(Json(jrd(&query.resource, &account.actor_iri))))
}

pub(crate) fn jrd(subject: &str, actor_iri: &str) -> Value {
    json!({
        "subject": subject,
        "links": [
            {
                "rel": "self",
                "type": "application/activity+json",
                "href": actor_iri,
            }
        ],
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::jrd;

    #[test]
    fn jrd_points_at_the_actor() {
        let doc = jrd(
            "acct:alice@social.example",
            "https://social.example/person/abc",
        );
        assert_eq!(doc.get("subject"), Some(&json!("acct:alice@social.example")));
        assert_eq!(
            doc.pointer("/links/0"),
            Some(&json!({
                "rel": "self",
                "type": "application/activity+json",
                "href": "https://social.example/person/abc",
            }))
        );
    }
}
