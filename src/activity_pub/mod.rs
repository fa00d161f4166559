pub(crate) mod addressing;
pub(crate) mod authz;
pub(crate) mod delivery;
pub(crate) mod hs2019;
pub(crate) mod machine;
mod mailman;
pub(crate) mod model;
pub(crate) mod repo;
mod simple_queue;

pub(crate) use mailman::Mailman;

use uuid::{Bytes, Uuid};

/// The well-known IRI marking world-visibility.
pub(crate) const PUBLIC_IRI: &str = "https://www.w3.org/ns/activitystreams#Public";

pub(crate) const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub(crate) const SECURITY_CONTEXT: &str = "https://w3id.org/security";
pub(crate) const BLOCKED_CONTEXT: &str = "https://purl.archive.org/socialweb/blocked";

/// Time-ordered key for queue rows.
pub(crate) fn uuidgen() -> Bytes {
    Uuid::now_v7().into_bytes()
}

/// Unguessable 128-bit token for minted IRIs and bearer credentials.
pub(crate) fn random_token() -> String {
    base62::encode(rand::random::<u128>())
}

/// Fresh object IRI: `base + "/" + type_lowercase + "/" + random_token`.
pub(crate) fn mint_iri(base_url: &str, obj_type: &str) -> String {
    format!("{base_url}/{}/{}", obj_type.to_lowercase(), random_token())
}

#[cfg(test)]
mod tests {
    use super::{mint_iri, random_token};

    #[test]
    fn tokens_are_long_and_distinct() {
        let a = random_token();
        let b = random_token();
        assert_ne!(a, b);
        // 128 bits of base62 never collapse below 17 digits
        assert!(a.len() >= 17);
    }

    #[test]
    fn minted_iris_are_typed_paths() {
        let iri = mint_iri("https://social.example", "Note");
        assert!(iri.starts_with("https://social.example/note/"));
    }
}
