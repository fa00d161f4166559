//! Storage friendly presentation of Activity Streams' core data model.

use anyhow::{Context, Result, bail};
use jiff::Timestamp;
use serde_json::{Map, Value, json};

use super::json_ld::JsonLdValue;

/// An open-content ActivityStreams object. Always a JSON object on the
/// inside; everything beyond the handful of first-class properties is an
/// opaque property bag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Object(Value);

impl TryFrom<Value> for Object {
    type Error = anyhow::Error;

    fn try_from(value: Value) -> Result<Self> {
        if !value.is_object() {
            bail!("value is not a JSON object");
        }
        Ok(Object(value))
    }
}

impl From<Object> for Value {
    fn from(object: Object) -> Self {
        object.0
    }
}

impl AsRef<Value> for Object {
    fn as_ref(&self) -> &Value {
        &self.0
    }
}

impl Object {
    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.0).context("unable to serialize object")
    }
    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Object> {
        let value: Value = serde_json::from_slice(bytes).context("unable to deserialize object")?;
        Object::try_from(value)
    }

    pub(crate) fn id(&self) -> Option<&str> {
        self.0.id()
    }
    pub(crate) fn obj_type(&self) -> Option<&str> {
        self.0.obj_type()
    }
    pub(crate) fn type_is(&self, ld_type: &str) -> bool {
        self.0.type_is(ld_type)
    }
    pub(crate) fn is_activity(&self) -> bool {
        self.0.is_activity()
    }
    pub(crate) fn is_tombstone(&self) -> bool {
        self.0.type_is("Tombstone")
    }
    pub(crate) fn get_str(&self, prop: &str) -> Option<&str> {
        self.0.get(prop).and_then(Value::as_str)
    }
    pub(crate) fn get_value(&self, prop: &str) -> Option<&Value> {
        self.0.get(prop)
    }
    pub(crate) fn object_iri(&self) -> Option<&str> {
        self.0.object_iri()
    }
    pub(crate) fn attributed_to(&self) -> Option<&str> {
        match self.0.get("attributedTo") {
            Some(Value::String(iri)) => Some(iri),
            Some(Value::Object(map)) => map.get("id").and_then(Value::as_str),
            Some(Value::Array(values)) => values.first().and_then(|value| match value {
                Value::String(iri) => Some(iri.as_str()),
                Value::Object(map) => map.get("id").and_then(Value::as_str),
                _ => None,
            }),
            _ => None,
        }
    }
    pub(crate) fn iris(&self, prop: &str) -> Vec<String> {
        self.0.iri_values(prop)
    }
    /// Recipient IRIs across every addressing property, duplicates removed,
    /// original order kept.
    pub(crate) fn audience_iris(&self) -> Vec<String> {
        let mut iris: Vec<String> = vec![];
        for prop in ["to", "cc", "bto", "bcc", "audience"] {
            for iri in self.0.iri_values(prop) {
                if !iris.contains(&iri) {
                    iris.push(iri);
                }
            }
        }
        iris
    }

    pub(crate) fn set_id(&mut self, iri: &str) {
        self.0.set_id(iri);
    }
    pub(crate) fn set(&mut self, prop: &str, value: Value) {
        let map = self.0.as_object_mut().expect("object is a JSON object");
        map.insert(prop.to_string(), value);
    }
    pub(crate) fn set_str(&mut self, prop: &str, value: &str) {
        self.set(prop, Value::String(value.to_string()));
    }
    pub(crate) fn remove(&mut self, prop: &str) {
        let map = self.0.as_object_mut().expect("object is a JSON object");
        map.remove(prop);
    }
    /// Stamp `published`/`updated` if absent, with one consistent timestamp.
    pub(crate) fn stamp_times(&mut self, now: Timestamp) {
        let map = self.0.as_object_mut().expect("object is a JSON object");
        map.entry("published")
            .or_insert_with(|| Value::String(now.to_string()));
        map.insert("updated".to_string(), Value::String(now.to_string()));
    }
    /// `bto`/`bcc` never appear on stored or delivered copies.
    pub(crate) fn strip_private_addressing(&mut self) {
        let map = self.0.as_object_mut().expect("object is a JSON object");
        map.remove("bto");
        map.remove("bcc");
    }

    /// Shallow merge for Update: `null` removes a property, anything else
    /// replaces it. `id`, `published` and the derived back-references are
    /// not patchable.
    pub(crate) fn merge_shallow(&mut self, fields: &Map<String, Value>) {
        let map = self.0.as_object_mut().expect("object is a JSON object");
        for (key, value) in fields {
            if ["id", "published", "replies", "likes", "shares"].contains(&key.as_str()) {
                continue;
            }
            if value.is_null() {
                map.remove(key);
            } else {
                map.insert(key.clone(), value.clone());
            }
        }
    }

    /// Collapse into a Tombstone: the id lives on, `formerType` records what
    /// was deleted, and every other property besides the retained set is
    /// dropped.
    pub(crate) fn into_tombstone(self, now: Timestamp) -> Object {
        let former_type = self.obj_type().unwrap_or("Object").to_string();
        let map = match self.0 {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let mut tombstone = Map::new();
        for key in ["id", "published"] {
            if let Some(value) = map.get(key) {
                tombstone.insert(key.to_string(), value.clone());
            }
        }
        tombstone.insert("type".to_string(), json!("Tombstone"));
        tombstone.insert("formerType".to_string(), json!(former_type));
        tombstone.insert("deleted".to_string(), json!(now.to_string()));
        tombstone.insert("updated".to_string(), json!(now.to_string()));
        tombstone.insert(
            "summaryMap".to_string(),
            json!({"en": "This object has been deleted"}),
        );
        Object(Value::Object(tombstone))
    }
}

#[cfg(test)]
mod tests {
    use jiff::Timestamp;
    use serde_json::json;

    use super::Object;

    #[test]
    fn merge_shallow_null_removes() {
        let mut note = Object::try_from(json!({
            "id": "https://social.example/note/1",
            "type": "Note",
            "content": "first draft",
            "published": "2025-02-10T15:04:55Z",
        }))
        .unwrap();
        let patch = json!({
            "content": null,
            "contentMap": {"en": "final", "fr": "fin"},
            "id": "https://evil.example/note/9",
        });
        note.merge_shallow(patch.as_object().unwrap());
        assert_eq!(note.get_str("content"), None);
        assert_eq!(
            note.get_value("contentMap"),
            Some(&json!({"en": "final", "fr": "fin"}))
        );
        // id and published are immutable under patching
        assert_eq!(note.id(), Some("https://social.example/note/1"));
        assert_eq!(note.get_str("published"), Some("2025-02-10T15:04:55Z"));
    }

    #[test]
    fn tombstone_keeps_identity() {
        let note = Object::try_from(json!({
            "id": "https://social.example/note/1",
            "type": "Note",
            "content": "soon gone",
            "published": "2025-02-10T15:04:55Z",
            "to": ["https://www.w3.org/ns/activitystreams#Public"],
        }))
        .unwrap();
        let now: Timestamp = "2025-03-01T00:00:00Z".parse().unwrap();
        let tombstone = note.into_tombstone(now);
        assert!(tombstone.is_tombstone());
        assert_eq!(tombstone.id(), Some("https://social.example/note/1"));
        assert_eq!(tombstone.get_str("formerType"), Some("Note"));
        assert_eq!(tombstone.get_str("published"), Some("2025-02-10T15:04:55Z"));
        assert_eq!(
            tombstone.get_value("summaryMap"),
            Some(&json!({"en": "This object has been deleted"}))
        );
        assert_eq!(tombstone.get_value("content"), None);
        assert_eq!(tombstone.get_value("to"), None);
    }

    #[test]
    fn audience_deduplicates_across_fields() {
        let note = Object::try_from(json!({
            "to": ["https://a.example/person/1", "https://b.example/person/2"],
            "bcc": "https://a.example/person/1",
            "audience": {"id": "https://c.example/orderedcollection/3"},
        }))
        .unwrap();
        assert_eq!(
            note.audience_iris(),
            vec![
                "https://a.example/person/1",
                "https://b.example/person/2",
                "https://c.example/orderedcollection/3"
            ]
        );
    }
}
