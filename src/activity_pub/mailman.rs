use std::time::Duration;

use anyhow::Result;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode, header};
use serde_json::Value;

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound HTTP for federation: fetching peer actors, keys and collections,
/// and POSTing signed activities to remote inboxes.
#[derive(Clone)]
pub(crate) struct Mailman {
    client: Client,
}

impl Mailman {
    pub(crate) fn new() -> Mailman {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/activity+json"),
        );
        Mailman {
            client: Client::builder()
                .user_agent(APP_USER_AGENT)
                .default_headers(headers)
                .gzip(true)
                .timeout(FETCH_TIMEOUT)
                .build()
                .expect("reqwest client options are static"),
        }
    }

    pub(crate) async fn fetch(&self, iri: &str) -> Result<Value> {
        let response = self.client.get(iri).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    /// POST a signed activity. Returns the response status so the caller can
    /// classify permanent versus transient failures.
    pub(crate) async fn post(
        &self,
        inbox: &str,
        headers: HeaderMap,
        body: &str,
    ) -> Result<StatusCode> {
        let response = self
            .client
            .post(inbox)
            .header(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("application/activity+json"),
            )
            .headers(headers)
            .body(body.to_string())
            .send()
            .await?;
        Ok(response.status())
    }
}

impl Default for Mailman {
    fn default() -> Self {
        Mailman::new()
    }
}
