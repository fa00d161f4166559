use serde_json::{Number, Value, json};

use super::Object;

/// Builder for OrderedCollection rows.
pub(crate) struct Collection(Value);

impl Collection {
    pub(crate) fn new_ordered(id: &str, owner: &str) -> Collection {
        Collection(json!({
            "id": id,
            "type": "OrderedCollection",
            "attributedTo": owner,
            "totalItems": 0,
        }))
    }
    pub(crate) fn total_items(mut self, total: u64) -> Collection {
        self.0
            .as_object_mut()
            .unwrap()
            .insert("totalItems".to_string(), Value::Number(Number::from(total)));
        self
    }
    pub(crate) fn first(mut self, link: &str) -> Collection {
        self.0
            .as_object_mut()
            .unwrap()
            .insert("first".to_string(), Value::String(link.to_string()));
        self
    }
    pub(crate) fn last(mut self, link: &str) -> Collection {
        self.0
            .as_object_mut()
            .unwrap()
            .insert("last".to_string(), Value::String(link.to_string()));
        self
    }
    pub(crate) fn name_map(mut self, name_map: Value) -> Collection {
        self.0
            .as_object_mut()
            .unwrap()
            .insert("nameMap".to_string(), name_map);
        self
    }
    /// World-readable collections carry the Public IRI; private ones carry
    /// no addressing at all, so only the owner passes the read rule.
    pub(crate) fn public(mut self) -> Collection {
        self.0.as_object_mut().unwrap().insert(
            "to".to_string(),
            json!(["https://www.w3.org/ns/activitystreams#Public"]),
        );
        self
    }
    pub(crate) fn build(self) -> Object {
        Object::try_from(self.0).expect("collection literal is a JSON object")
    }
}

/// Builder for OrderedCollectionPage rows.
pub(crate) struct CollectionPage(Value);

impl CollectionPage {
    pub(crate) fn new(id: &str, part_of: &str, owner: &str) -> CollectionPage {
        CollectionPage(json!({
            "id": id,
            "type": "OrderedCollectionPage",
            "partOf": part_of,
            "attributedTo": owner,
            "orderedItems": [],
        }))
    }
    pub(crate) fn next(mut self, link: &str) -> CollectionPage {
        self.0
            .as_object_mut()
            .unwrap()
            .insert("next".to_string(), Value::String(link.to_string()));
        self
    }
    pub(crate) fn addressing_of(mut self, collection: &Object) -> CollectionPage {
        if let Some(to) = collection.get_value("to") {
            self.0
                .as_object_mut()
                .unwrap()
                .insert("to".to_string(), to.clone());
        }
        self
    }
    pub(crate) fn build(self) -> Object {
        Object::try_from(self.0).expect("page literal is a JSON object")
    }
}
