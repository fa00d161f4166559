use serde_json::Value;

/// Validate JSON values with JSON-LD semantics
pub(crate) trait JsonLdValue {
    /// JSON-LD type is (`type` may be a string or an array of strings)
    fn type_is(&self, ld_type: &str) -> bool;
    /// First declared type
    fn obj_type(&self) -> Option<&str>;
    /// Check required properties
    fn has_props(&self, props: &[&str]) -> bool;
    /// The value is a ActivityStreams Activity
    fn is_activity(&self) -> bool;
    /// IRI of the `object` property (string, object with id, or array head)
    fn object_iri(&self) -> Option<&str>;
    fn id(&self) -> Option<&str>;
    /// Update the id property
    fn set_id(&mut self, id_iri: &str);
    /// All IRIs found under `prop`: a string, an object with an `id`, or an
    /// array of either. Nested values without ids are skipped.
    fn iri_values(&self, prop: &str) -> Vec<String>;
}

fn value_iri(value: &Value) -> Option<&str> {
    match value {
        Value::String(iri) => Some(iri),
        Value::Object(map) => map.get("id").and_then(Value::as_str),
        _ => None,
    }
}

impl JsonLdValue for Value {
    fn type_is(&self, ld_type: &str) -> bool {
        match self.get("type") {
            Some(Value::String(typ)) => typ == ld_type,
            Some(Value::Array(types)) => types.iter().any(|t| t.as_str() == Some(ld_type)),
            _ => false,
        }
    }
    fn obj_type(&self) -> Option<&str> {
        match self.get("type") {
            Some(Value::String(typ)) => Some(typ),
            Some(Value::Array(types)) => types.first().and_then(Value::as_str),
            _ => None,
        }
    }
    fn has_props(&self, props: &[&str]) -> bool {
        if let Some(map) = self.as_object() {
            return props.iter().all(|&key| map.contains_key(key));
        }
        false
    }
    fn is_activity(&self) -> bool {
        let Some(typ) = self.obj_type() else {
            return false;
        };
        [
            "Accept",
            "Add",
            "Announce",
            "Arrive",
            "Block",
            "Create",
            "Delete",
            "Dislike",
            "Flag",
            "Follow",
            "Ignore",
            "IntransitiveActivity",
            "Invite",
            "Join",
            "Leave",
            "Like",
            "Listen",
            "Move",
            "Offer",
            "Question",
            "Reject",
            "Read",
            "Remove",
            "TentativeReject",
            "TentativeAccept",
            "Travel",
            "Undo",
            "Update",
            "View",
        ]
        .contains(&typ)
    }
    fn object_iri(&self) -> Option<&str> {
        match self.get("object") {
            Some(Value::Array(values)) => values.first().and_then(value_iri),
            Some(value) => value_iri(value),
            None => None,
        }
    }
    fn id(&self) -> Option<&str> {
        self.get("id").and_then(Value::as_str)
    }
    fn set_id(&mut self, id_iri: &str) {
        let map = self.as_object_mut().expect("value should be a JSON object");
        map.insert("id".to_string(), Value::String(id_iri.to_string()));
    }
    fn iri_values(&self, prop: &str) -> Vec<String> {
        let mut iris = vec![];
        match self.get(prop) {
            Some(Value::Array(values)) => {
                for value in values {
                    if let Some(iri) = value_iri(value) {
                        iris.push(iri.to_string());
                    }
                }
            }
            Some(value) => {
                if let Some(iri) = value_iri(value) {
                    iris.push(iri.to_string());
                }
            }
            None => {}
        }
        iris
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::JsonLdValue;

    #[test]
    fn type_matches_string_and_array() {
        let single = json!({"type": "Note"});
        assert!(single.type_is("Note"));
        let multi = json!({"type": ["Tombstone", "Note"]});
        assert!(multi.type_is("Note"));
        assert_eq!(multi.obj_type(), Some("Tombstone"));
    }

    #[test]
    fn iri_values_flatten() {
        let value = json!({
            "to": ["https://a.example/person/1", {"id": "https://b.example/person/2"}],
            "cc": "https://c.example/person/3",
        });
        assert_eq!(
            value.iri_values("to"),
            vec!["https://a.example/person/1", "https://b.example/person/2"]
        );
        assert_eq!(value.iri_values("cc"), vec!["https://c.example/person/3"]);
        assert!(value.iri_values("audience").is_empty());
    }

    #[test]
    fn object_iri_variants() {
        assert_eq!(
            json!({"object": "https://x.example/note/1"}).object_iri(),
            Some("https://x.example/note/1")
        );
        assert_eq!(
            json!({"object": {"id": "https://x.example/note/2"}}).object_iri(),
            Some("https://x.example/note/2")
        );
        assert_eq!(json!({"object": 42}).object_iri(), None);
    }
}
