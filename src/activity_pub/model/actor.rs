use pem_rfc7468::LineEnding;
use serde_json::json;

use super::Object;

/// Read-side view over a stored or fetched Person object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Actor(Object);

impl From<Object> for Actor {
    fn from(object: Object) -> Self {
        Actor(object)
    }
}

impl AsRef<Object> for Actor {
    fn as_ref(&self) -> &Object {
        &self.0
    }
}

impl Actor {
    pub(crate) fn id(&self) -> Option<&str> {
        self.0.id()
    }
    pub(crate) fn inbox(&self) -> Option<&str> {
        self.0.get_str("inbox")
    }
    pub(crate) fn outbox(&self) -> Option<&str> {
        self.0.get_str("outbox")
    }
    pub(crate) fn followers(&self) -> Option<&str> {
        self.0.get_str("followers")
    }
    pub(crate) fn following(&self) -> Option<&str> {
        self.0.get_str("following")
    }
    pub(crate) fn liked(&self) -> Option<&str> {
        self.0.get_str("liked")
    }
    pub(crate) fn blocked(&self) -> Option<&str> {
        self.0.get_str("blocked")
    }
}

/// The seven per-actor collection IRIs, minted once at registration and
/// stable for the actor's lifetime.
pub(crate) struct ActorCollections {
    pub(crate) inbox: String,
    pub(crate) outbox: String,
    pub(crate) followers: String,
    pub(crate) following: String,
    pub(crate) liked: String,
    pub(crate) blocked: String,
}

/// Build the Person object for a freshly registered local account.
pub(crate) fn local_person(
    actor_iri: &str,
    username: &str,
    collections: &ActorCollections,
    key_iri: &str,
    public_key_der: &[u8],
) -> Object {
    let pem = pem_rfc7468::encode_string("PUBLIC KEY", LineEnding::LF, public_key_der)
        .expect("public key DER encodes to PEM");
    let person = json!({
        "id": actor_iri,
        "type": "Person",
        "attributedTo": actor_iri,
        "name": username,
        "preferredUsername": username,
        "inbox": collections.inbox,
        "outbox": collections.outbox,
        "followers": collections.followers,
        "following": collections.following,
        "liked": collections.liked,
        "blocked": collections.blocked,
        "publicKey": {
            "id": key_iri,
            "type": "Key",
            "owner": actor_iri,
            "publicKeyPem": pem,
        },
        "to": ["https://www.w3.org/ns/activitystreams#Public"],
    });
    Object::try_from(person).expect("person literal is a JSON object")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Actor, ActorCollections, Object, local_person};

    #[test]
    fn person_carries_collections_and_key() {
        let collections = ActorCollections {
            inbox: "https://social.example/orderedcollection/in".into(),
            outbox: "https://social.example/orderedcollection/out".into(),
            followers: "https://social.example/orderedcollection/fr".into(),
            following: "https://social.example/orderedcollection/fg".into(),
            liked: "https://social.example/orderedcollection/ld".into(),
            blocked: "https://social.example/orderedcollection/bl".into(),
        };
        let person = local_person(
            "https://social.example/person/abc",
            "alice",
            &collections,
            "https://social.example/key/k1",
            &[48, 13, 6, 9],
        );
        let actor = Actor::from(person);
        assert_eq!(actor.id(), Some("https://social.example/person/abc"));
        assert_eq!(
            actor.inbox(),
            Some("https://social.example/orderedcollection/in")
        );
        assert_eq!(
            actor.blocked(),
            Some("https://social.example/orderedcollection/bl")
        );
        let key = actor.as_ref().get_value("publicKey").unwrap();
        assert_eq!(key.get("owner"), Some(&json!("https://social.example/person/abc")));
        assert!(
            key.get("publicKeyPem")
                .and_then(|pem| pem.as_str())
                .unwrap()
                .starts_with("-----BEGIN PUBLIC KEY-----")
        );
    }

    #[test]
    fn actor_view_over_arbitrary_object() {
        let object = Object::try_from(json!({
            "id": "https://remote.example/person/x",
            "type": "Person",
            "inbox": "https://remote.example/inbox/x",
        }))
        .unwrap();
        let actor = Actor::from(object);
        assert_eq!(actor.inbox(), Some("https://remote.example/inbox/x"));
        assert_eq!(actor.outbox(), None);
    }
}
