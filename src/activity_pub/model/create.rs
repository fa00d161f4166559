use anyhow::{Result, bail};
use jiff::Timestamp;
use serde_json::{Value, json};

use super::Object;
use super::json_ld::JsonLdValue;

/// A Create activity in the C2S pipeline. Plain objects POSTed to an outbox
/// are wrapped into one, inheriting the object's addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Create(Value);

impl TryFrom<Object> for Create {
    type Error = anyhow::Error;

    fn try_from(object: Object) -> Result<Self> {
        let value: Value = object.into();

        if value.type_is("Create") {
            if !value.has_props(&["object"]) {
                bail!("Create activity must have an object property");
            }
            return Ok(Create(value));
        }
        if value.is_activity() {
            bail!("activity of type {:?} is not a Create", value.obj_type());
        }

        let mut create = json!({
            "type": "Create",
            "published": Timestamp::now().to_string(),
        });
        let map = create.as_object_mut().unwrap();
        for prop in ["to", "bto", "cc", "bcc", "audience"] {
            if let Some(v) = value.get(prop) {
                map.insert(prop.to_string(), v.clone());
            }
        }
        map.insert("object".to_string(), value);

        Ok(Create(create))
    }
}

impl From<Create> for Object {
    fn from(create: Create) -> Self {
        Object::try_from(create.0).expect("create is a JSON object")
    }
}

impl Create {
    pub(crate) fn take_object(&mut self) -> Option<Object> {
        let map = self.0.as_object_mut().unwrap();
        let embedded = map.remove("object")?;
        Object::try_from(embedded).ok()
    }
    pub(crate) fn put_object(&mut self, object: &Object) {
        let map = self.0.as_object_mut().unwrap();
        map.insert("object".to_string(), object.as_ref().clone());
    }
}
