mod auth;
mod content_type;
mod register;
mod webfinger;

use std::sync::Arc;

use anyhow::Result;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Router, body::Bytes};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tracing::info;

use crate::activity_pub::authz::Authz;
use crate::activity_pub::hs2019::{self, KeyResolver};
use crate::activity_pub::machine::{
    InboxRequest, MachineMsg, OutboxRequest, get_machine,
};
use crate::activity_pub::Mailman;
use crate::activity_pub::repo::{AccountRepo, CollectionStore, ObjectRepo};
use crate::config::RuntimeConfig;
use crate::error::ApiError;

pub(crate) use content_type::{ActivityJson, with_context};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) config: RuntimeConfig,
    keys: Arc<KeyResolver>,
}

pub(crate) async fn serve(config: &RuntimeConfig) -> Result<()> {
    if let (Some(cert), Some(key)) = (&config.init.tls_cert, &config.init.tls_key) {
        info!(
            target: "http",
            cert = %cert.display(),
            key = %key.display(),
            "TLS material configured for the terminating listener"
        );
    }
    let app = router(config.clone());
    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.init.port)).await?;
    info!(target: "http", port = config.init.port, "http API server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

pub(crate) fn router(config: RuntimeConfig) -> Router {
    let state = AppState {
        config,
        keys: Arc::new(KeyResolver::new(Mailman::new())),
    };
    Router::new()
        .route("/", get(get_root))
        .route("/register", get(register::form).post(register::submit))
        .route("/.well-known/webfinger", get(webfinger::resolve))
        .route("/person/{id}", get(get_typed_object))
        .route("/key/{id}", get(get_key))
        .route(
            "/orderedcollection/{id}",
            get(get_collection).post(post_collection),
        )
        .route("/orderedcollectionpage/{id}", get(get_collection_page))
        .route("/{type}/{id}", get(get_object))
        .with_state(state)
}

struct Repos {
    objects: ObjectRepo,
    accounts: AccountRepo,
    authz: Authz,
}

fn repos(state: &AppState) -> Result<Repos, ApiError> {
    let keyspace = state.config.keyspace.clone();
    let base_url = state.config.init.base_url();
    let objects = ObjectRepo::new(keyspace.clone())?;
    let collections =
        CollectionStore::new(keyspace.clone(), &base_url, state.config.init.page_size)?;
    let accounts = AccountRepo::new(keyspace)?;
    let authz = Authz::new(objects.clone(), collections, &base_url);
    Ok(Repos {
        objects,
        accounts,
        authz,
    })
}

async fn get_root(State(state): State<AppState>) -> ActivityJson {
    let service = json!({
        "type": "Service",
        "name": "One Page Pub",
        "id": state.config.init.base_url(),
    });
    ActivityJson(StatusCode::OK, Json(with_context(service)))
}

/// Serve a stored object row, tombstones as 410, everything else through
/// the read rule.
fn serve_object(repos: &Repos, iri: &str, viewer: Option<&str>) -> Result<Value, ApiError> {
    let object = repos.objects.find_one(iri)?.ok_or(ApiError::NotFound)?;
    if object.is_tombstone() {
        return Err(ApiError::Gone(with_context(object.into())));
    }
    repos.authz.can_read(viewer, &object)?;
    Ok(with_context(object.into()))
}

async fn get_typed_object(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<ActivityJson, ApiError> {
    serve_by_path(&state, "person", &id, &headers)
}

async fn get_object(
    State(state): State<AppState>,
    Path((obj_type, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<ActivityJson, ApiError> {
    serve_by_path(&state, &obj_type, &id, &headers)
}

fn serve_by_path(
    state: &AppState,
    obj_type: &str,
    id: &str,
    headers: &HeaderMap,
) -> Result<ActivityJson, ApiError> {
    let repos = repos(state)?;
    let viewer = auth::viewer_account(headers, &repos.accounts)?;
    let iri = format!("{}/{}/{}", state.config.init.base_url(), obj_type, id);
    let value = serve_object(&repos, &iri, viewer.as_ref().map(|a| a.actor_iri.as_str()))?;
    Ok(ActivityJson(StatusCode::OK, Json(value)))
}

async fn get_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ActivityJson, ApiError> {
    let repos = repos(&state)?;
    let iri = format!("{}/key/{}", state.config.init.base_url(), id);
    let key = repos.objects.find_one(&iri)?.ok_or(ApiError::NotFound)?;
    Ok(ActivityJson(StatusCode::OK, Json(with_context(key.into()))))
}

async fn get_collection(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<ActivityJson, ApiError> {
    serve_by_path(&state, "orderedcollection", &id, &headers)
}

async fn get_collection_page(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<ActivityJson, ApiError> {
    let repos = repos(&state)?;
    let viewer = auth::viewer_account(&headers, &repos.accounts)?;
    let viewer_iri = viewer.as_ref().map(|a| a.actor_iri.as_str());
    let iri = format!(
        "{}/orderedcollectionpage/{}",
        state.config.init.base_url(),
        id
    );
    let page = repos.objects.find_one(&iri)?.ok_or(ApiError::NotFound)?;
    repos.authz.can_read(viewer_iri, &page)?;

    // Per-item visibility filter; failing items are silently dropped but
    // the collection keeps its unfiltered total.
    let mut value: Value = page.into();
    let items = value
        .get("orderedItems")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut visible = vec![];
    for item in items {
        let Some(item_iri) = item.as_str() else {
            continue;
        };
        let Some(object) = repos.objects.find_one(item_iri)? else {
            continue;
        };
        if !object.is_tombstone() && repos.authz.can_read(viewer_iri, &object).is_ok() {
            visible.push(item);
        }
    }
    let part_of = value
        .get("partOf")
        .and_then(Value::as_str)
        .map(str::to_string);
    let map = value.as_object_mut().expect("page rows are objects");
    map.insert("orderedItems".to_string(), Value::Array(visible));
    if let Some(part_of) = part_of {
        if let Some(coll) = repos.objects.find_one(&part_of)? {
            if let Some(total) = coll.get_value("totalItems") {
                map.insert("totalItems".to_string(), total.clone());
            }
        }
    }
    Ok(ActivityJson(StatusCode::OK, Json(with_context(value))))
}

/// POST to a collection IRI is how both mailboxes work: the owner's outbox
/// takes bearer-authenticated client activities, the owner's inbox takes
/// signature-verified federated deliveries.
async fn post_collection(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<ActivityJson, ApiError> {
    let repos = repos(&state)?;
    let iri = format!("{}/orderedcollection/{}", state.config.init.base_url(), id);

    if let Some(token) = auth::bearer_token(&headers) {
        let account = repos
            .accounts
            .find_by_token(token)?
            .ok_or(ApiError::Unauthorized)?;
        if account.outbox != iri {
            // Bearer credentials only ever write to their own outbox
            return Err(ApiError::Forbidden);
        }
        let payload: Value = serde_json::from_slice(&body)
            .map_err(|_| ApiError::bad_request("body must be JSON"))?;
        let machine = get_machine()?;
        let stored = ractor::call!(
            machine,
            MachineMsg::OutboxPost,
            OutboxRequest {
                username: account.username,
                payload,
            }
        )
        .map_err(|error| ApiError::Internal(anyhow::anyhow!("machine call failed: {error}")))??;
        return Ok(ActivityJson(StatusCode::OK, Json(with_context(stored))));
    }

    // Federated delivery into an inbox
    let path = format!("/orderedcollection/{id}");
    let sender_iri = hs2019::verify_request(&path, &headers, &body, &state.keys).await?;
    let owner = inbox_owner(&repos, &iri)?.ok_or(ApiError::NotFound)?;
    let activity: Value = serde_json::from_slice(&body)
        .map_err(|_| ApiError::bad_request("body must be JSON"))?;
    let machine = get_machine()?;
    ractor::call!(
        machine,
        MachineMsg::InboxPost,
        InboxRequest {
            owner_username: owner,
            sender_iri,
            activity,
        }
    )
    .map_err(|error| ApiError::Internal(anyhow::anyhow!("machine call failed: {error}")))??;
    Ok(ActivityJson(StatusCode::ACCEPTED, Json(json!({}))))
}

/// The username whose inbox is this collection, if any.
fn inbox_owner(repos: &Repos, coll_iri: &str) -> Result<Option<String>, ApiError> {
    let Some(coll) = repos.objects.find_one(coll_iri)? else {
        return Ok(None);
    };
    let Some(owner_iri) = coll.attributed_to() else {
        return Ok(None);
    };
    let Some(account) = repos.accounts.find_by_actor(owner_iri)? else {
        return Ok(None);
    };
    Ok((account.inbox == coll_iri).then_some(account.username))
}
