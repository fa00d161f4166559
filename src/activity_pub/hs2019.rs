//! HTTP signatures for federation: RSA-SHA256 over
//! `(request-target) host date digest`, verified against a remotely fetched
//! actor key.

use std::collections::HashMap;
use std::iter::Peekable;
use std::str::Chars;

use anyhow::{Context, Result, bail};
use aws_lc_rs::rand::SystemRandom;
use aws_lc_rs::rsa::KeyPair;
use aws_lc_rs::signature::{
    RSA_PKCS1_2048_8192_SHA256, RSA_PKCS1_SHA256, RSA_PSS_2048_8192_SHA256, UnparsedPublicKey,
    VerificationAlgorithm,
};
use base64ct::{Base64, Encoding};
use const_oid::db::rfc5912::RSA_ENCRYPTION;
use jiff::civil::DateTime;
use jiff::tz::TimeZone;
use jiff::Timestamp;
use reqwest::Url;
use reqwest::header::{self, HeaderMap};
use sha2::{Digest, Sha256, Sha512};
use spki::SubjectPublicKeyInfoRef;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::ApiError;

use super::Mailman;
use super::model::JsonLdValue;

const HTTP_DATE_FMT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Verified requests may be dated at most this far from our clock.
const MAX_CLOCK_SKEW_SECS: i64 = 5 * 60;

/// Sign an outgoing POST with the sender's private key, covering
/// `(request-target) host date digest`.
pub(crate) fn post_headers(
    key_id: &str,
    inbox: &str,
    body: &str,
    private_key_der: &[u8],
) -> Result<HeaderMap> {
    let digest = base64_sha256_string(body.as_bytes());
    let url = Url::parse(inbox)?;
    let host = url
        .host()
        .context("inbox should have a host component")?
        .to_string();
    let path = url.path();
    let date = Timestamp::now().strftime(HTTP_DATE_FMT).to_string();

    let sig_body =
        format!("(request-target): post {path}\nhost: {host}\ndate: {date}\ndigest: SHA-256={digest}");
    let key_pair = KeyPair::from_pkcs8(private_key_der).context("invalid signing key")?;
    let rng = SystemRandom::new();
    let mut rsa_signature = vec![0; key_pair.public_modulus_len()];
    key_pair.sign(
        &RSA_PKCS1_SHA256,
        &rng,
        sig_body.as_bytes(),
        &mut rsa_signature,
    )?;
    let signature = Base64::encode_string(&rsa_signature);

    let mut headers = HeaderMap::new();
    headers.insert(header::HOST, host.parse()?);
    headers.insert(header::DATE, date.parse()?);
    headers.insert("Digest", format!("SHA-256={digest}").parse()?);
    headers.insert(
        "Signature",
        format!(
            "keyId=\"{key_id}\",algorithm=\"rsa-sha256\",headers=\"(request-target) host date digest\",signature=\"{signature}\""
        )
        .parse()?,
    );

    Ok(headers)
}

fn base64_sha256_string(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Base64::encode_string(hasher.finalize().as_slice())
}

fn base64_sha512_string(bytes: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(bytes);
    Base64::encode_string(hasher.finalize().as_slice())
}

/// A fetched signing key: the PEM plus the actor that owns it.
#[derive(Debug, Clone)]
pub(crate) struct FetchedKey {
    pub(crate) owner: String,
    pub(crate) pem: String,
}

/// Dereferences `keyId` IRIs, remembering what it saw.
pub(crate) struct KeyResolver {
    mailman: Mailman,
    cache: Mutex<HashMap<String, FetchedKey>>,
}

impl KeyResolver {
    pub(crate) fn new(mailman: Mailman) -> KeyResolver {
        KeyResolver {
            mailman,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn resolve(&self, key_id: &str) -> Result<FetchedKey, ApiError> {
        if let Some(key) = self.cache.lock().await.get(key_id) {
            return Ok(key.clone());
        }
        let value = self
            .mailman
            .fetch(key_id)
            .await
            .map_err(|error| ApiError::Upstream(format!("key fetch failed: {error}")))?;
        let (owner, pem) = if value.type_is("Key") {
            (
                value.get("owner").and_then(|v| v.as_str()),
                value.get("publicKeyPem").and_then(|v| v.as_str()),
            )
        } else {
            let key = value.get("publicKey");
            (
                key.and_then(|k| k.get("owner")).and_then(|v| v.as_str()),
                key.and_then(|k| k.get("publicKeyPem"))
                    .and_then(|v| v.as_str()),
            )
        };
        let (Some(owner), Some(pem)) = (owner, pem) else {
            return Err(ApiError::bad_request("keyId does not resolve to a key"));
        };
        let key = FetchedKey {
            owner: owner.to_string(),
            pem: pem.to_string(),
        };
        self.cache
            .lock()
            .await
            .insert(key_id.to_string(), key.clone());
        Ok(key)
    }
}

/// Verify an inbound signed request. Returns the IRI of the signing actor.
pub(crate) async fn verify_request(
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
    keys: &KeyResolver,
) -> Result<String, ApiError> {
    let signature_header = headers
        .get("signature")
        .ok_or(ApiError::Unauthorized)?
        .to_str()
        .map_err(|_| ApiError::bad_request("malformed signature header"))?;
    let sig_params = parse_sig_params(signature_header)
        .map_err(|error| ApiError::bad_request(format!("malformed signature header: {error}")))?;
    if let Some(algorithm) = sig_params.get("algorithm") {
        if !["hs2019", "rsa-sha256"].contains(&algorithm.as_str()) {
            warn!(
                "unknown http signature algorithm {algorithm} used, verification will likely fail"
            );
        }
    }
    let signature = sig_params
        .get("signature")
        .ok_or(ApiError::Unauthorized)
        .and_then(|b64| {
            Base64::decode_vec(b64).map_err(|_| ApiError::bad_request("undecodable signature"))
        })?;
    let sig_headers = sig_params
        .get("headers")
        .map(|list| parse_headers(list))
        .transpose()
        .map_err(|error| ApiError::bad_request(format!("malformed headers list: {error}")))?
        .unwrap_or_else(|| vec!["date".to_string()]);
    if sig_headers.is_empty() {
        return Err(ApiError::bad_request("empty signature headers list"));
    }
    let key_id = sig_params.get("keyId").ok_or(ApiError::Unauthorized)?;

    // Clock skew guard on the Date header
    let date = headers
        .get("date")
        .ok_or(ApiError::Unauthorized)?
        .to_str()
        .map_err(|_| ApiError::bad_request("malformed date header"))?;
    let sent_at = parse_http_date(date)
        .map_err(|_| ApiError::bad_request("malformed date header"))?;
    let skew = Timestamp::now().as_second() - sent_at.as_second();
    if skew.abs() > MAX_CLOCK_SKEW_SECS {
        return Err(ApiError::Unauthorized);
    }

    // Body digest must match what the client declared
    let declared_digest = headers
        .get("digest")
        .ok_or(ApiError::Unauthorized)?
        .to_str()
        .map_err(|_| ApiError::bad_request("malformed digest header"))?;
    if !digest_matches(declared_digest, body) {
        return Err(ApiError::Unauthorized);
    }

    let mut sig_body = String::new();
    for header in sig_headers {
        match header.as_str() {
            "(request-target)" => {
                sig_body.push_str(&format!("(request-target): post {path}\n"));
            }
            "(created)" => {
                let created = sig_params.get("created").ok_or(ApiError::Unauthorized)?;
                sig_body.push_str(&format!("(created): {created}\n"));
            }
            "(expires)" => {
                let expires = sig_params.get("expires").ok_or(ApiError::Unauthorized)?;
                sig_body.push_str(&format!("(expires): {expires}\n"));
            }
            field => {
                let value = headers.get(field).ok_or(ApiError::Unauthorized)?;
                sig_body.push_str(&format!(
                    "{field}: {}\n",
                    value
                        .to_str()
                        .map_err(|_| ApiError::bad_request("unprintable signed header"))?
                ));
            }
        }
    }
    let sig_body = sig_body.trim_end();

    let key = keys.resolve(key_id).await?;
    if !verify_with_pem(sig_body.as_bytes(), &signature, &key.pem)? {
        return Err(ApiError::Unauthorized);
    }
    Ok(key.owner)
}

fn digest_matches(declared: &str, body: &[u8]) -> bool {
    let Some((alg, value)) = declared.split_once('=').map(|(alg, rest)| (alg, rest)) else {
        return false;
    };
    match alg.to_ascii_lowercase().as_str() {
        "sha-256" => value == base64_sha256_string(body),
        "sha-512" => value == base64_sha512_string(body),
        _ => false,
    }
}

fn parse_http_date(date: &str) -> Result<Timestamp> {
    let parsed = jiff::fmt::strtime::parse(HTTP_DATE_FMT, date)?;
    let datetime: DateTime = parsed.to_datetime()?;
    Ok(datetime.to_zoned(TimeZone::UTC)?.timestamp())
}

/// Verify an RSA signature against a SPKI PEM public key.
pub(crate) fn verify_with_pem(message: &[u8], signature: &[u8], pem: &str) -> Result<bool, ApiError> {
    let (label, der) = pem_rfc7468::decode_vec(pem.as_bytes())
        .map_err(|_| ApiError::bad_request("undecodable public key PEM"))?;
    if label != "PUBLIC KEY" {
        return Err(ApiError::bad_request("unsupported PEM label"));
    }
    let spki = SubjectPublicKeyInfoRef::try_from(der.as_ref())
        .map_err(|_| ApiError::bad_request("undecodable public key"))?;
    if spki.algorithm.oid != RSA_ENCRYPTION {
        return Err(ApiError::bad_request("only RSA keys are supported"));
    }
    let spk = spki
        .subject_public_key
        .as_bytes()
        .ok_or_else(|| ApiError::bad_request("undecodable public key"))?;

    let algorithms: &[&'static dyn VerificationAlgorithm] = &[
        &RSA_PKCS1_2048_8192_SHA256 as &dyn VerificationAlgorithm,
        &RSA_PSS_2048_8192_SHA256 as &dyn VerificationAlgorithm,
    ];
    Ok(algorithms.iter().any(|&alg| {
        UnparsedPublicKey::new(alg, spk)
            .verify(message, signature)
            .is_ok()
    }))
}

fn parse_sig_params(input: &str) -> Result<HashMap<String, String>> {
    let mut params = HashMap::new();
    let mut it = input.chars().peekable();
    while it.peek().is_some() {
        eat_bws(&mut it);
        let token = eat_token(&mut it)?;
        eat_bws(&mut it);
        eat_eq(&mut it)?;
        eat_bws(&mut it);
        let value = if it.peek() == Some(&'"') {
            eat_quoted_string(&mut it)?
        } else {
            eat_token(&mut it)?
        };
        params.insert(token, value);
        eat_bws(&mut it);
        if it.peek().is_none() {
            break;
        }
        eat_comma(&mut it)?;
        eat_bws(&mut it);
    }
    Ok(params)
}

fn parse_headers(input: &str) -> Result<Vec<String>> {
    let mut headers = vec![];
    let mut it = input.chars().peekable();
    while it.peek().is_some() {
        eat_bws(&mut it);
        let header = eat_string(&mut it)?;
        headers.push(header.to_ascii_lowercase());
        eat_bws(&mut it);
    }
    Ok(headers)
}

fn eat_bws(it: &mut Peekable<Chars<'_>>) {
    while it.next_if(char::is_ascii_whitespace).is_some() {}
}
fn eat_eq(it: &mut Peekable<Chars<'_>>) -> Result<()> {
    if it.next_if_eq(&'=').is_none() {
        bail!("invalid auth-param, missing expected '='");
    }
    Ok(())
}
fn eat_comma(it: &mut Peekable<Chars<'_>>) -> Result<()> {
    if it.next_if_eq(&',').is_none() {
        bail!("invalid auth-param, missing expected ','");
    }
    Ok(())
}
#[rustfmt::skip]
fn is_tchar(c: &char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(c, '!'| '#'| '$'| '%'| '&'| '\''| '*'| '+'| '-'| '.'| '^'| '_'| '`'| '|'| '~')
}
fn eat_token(it: &mut Peekable<Chars<'_>>) -> Result<String> {
    let mut token = String::new();
    while let Some(c) = it.next_if(is_tchar) {
        token.push(c);
    }
    if token.is_empty() {
        bail!("expected at least one tchar");
    }
    Ok(token)
}
fn eat_string(it: &mut Peekable<Chars<'_>>) -> Result<String> {
    let mut token = String::new();
    while let Some(c) = it.next_if(|c| !c.is_ascii_whitespace()) {
        token.push(c);
    }
    if token.is_empty() {
        bail!("expected at least one char");
    }
    Ok(token)
}
fn eat_quoted_string(it: &mut Peekable<Chars<'_>>) -> Result<String> {
    let mut string = String::new();
    if it.next_if_eq(&'"').is_none() {
        bail!("expected DQUOTE");
    }
    let mut has_right_dquote = false;
    while let Some(c) = it.next() {
        // quoted-pair
        if c == '\\' {
            if it.next_if_eq(&'"').is_some() {
                string.push('"');
            }
            continue;
        }
        if c == '"' {
            has_right_dquote = true;
            break;
        }
        string.push(c);
    }
    if !has_right_dquote {
        bail!("expected a pair of DQUOTE");
    }
    Ok(string)
}

/// Generate a fresh RSA-2048 keypair for a registered actor; returns
/// `(private PKCS#8 DER, public SPKI DER)`.
pub(crate) fn generate_key_pair() -> Result<(Vec<u8>, Vec<u8>)> {
    use aws_lc_rs::encoding::AsDer;
    use aws_lc_rs::rsa::{KeySize, PrivateDecryptingKey};

    let private = PrivateDecryptingKey::generate(KeySize::Rsa2048)
        .map_err(|_| anyhow::anyhow!("RSA key generation failed"))?;
    let private_der = private
        .as_der()
        .map_err(|_| anyhow::anyhow!("private key DER encoding failed"))?;
    let public_der = private
        .public_key()
        .as_der()
        .map_err(|_| anyhow::anyhow!("public key DER encoding failed"))?;
    Ok((
        private_der.as_ref().to_vec(),
        public_der.as_ref().to_vec(),
    ))
}
