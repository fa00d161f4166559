use anyhow::{Context, Result};
use fjall::{Batch, Keyspace, PartitionCreateOptions, PartitionHandle};
use jiff::Timestamp;
use serde_json::{Map, Value};

use crate::activity_pub::model::Object;
use crate::error::ApiError;

/// Object rows keyed by IRI. Objects are never physically removed; Delete
/// turns the row into a Tombstone in place.
#[derive(Clone)]
pub(crate) struct ObjectRepo {
    objects: PartitionHandle,
}

impl ObjectRepo {
    pub(crate) fn new(keyspace: Keyspace) -> Result<ObjectRepo> {
        let objects = keyspace.open_partition("objects", PartitionCreateOptions::default())?;
        Ok(ObjectRepo { objects })
    }

    /// Insert a fresh object. A row under the same IRI is a conflict.
    pub(crate) fn put(&self, b: &mut Batch, object: &Object) -> Result<(), ApiError> {
        let iri = object
            .id()
            .ok_or_else(|| ApiError::bad_request("object must have an id"))?;
        if self.contains(iri)? {
            return Err(ApiError::Conflict(format!("{iri} already exists")));
        }
        self.upsert(b, object)?;
        Ok(())
    }

    /// Write an object row, replacing whatever was there.
    pub(crate) fn upsert(&self, b: &mut Batch, object: &Object) -> Result<()> {
        let iri = object.id().context("object must have an id")?;
        b.insert(&self.objects, iri, object.to_bytes()?);
        Ok(())
    }

    pub(crate) fn contains(&self, iri: &str) -> Result<bool> {
        Ok(self.objects.contains_key(iri)?)
    }

    pub(crate) fn find_one(&self, iri: &str) -> Result<Option<Object>> {
        if let Some(bytes) = self.objects.get(iri)? {
            let object = Object::from_bytes(&bytes)?;
            return Ok(Some(object));
        }
        Ok(None)
    }

    /// Shallow-merge `fields` into the row: `null` removes, everything else
    /// replaces. Advances `updated`.
    pub(crate) fn patch(
        &self,
        b: &mut Batch,
        iri: &str,
        fields: &Map<String, Value>,
        now: Timestamp,
    ) -> Result<Object, ApiError> {
        let mut object = self.find_one(iri)?.ok_or(ApiError::NotFound)?;
        if object.is_tombstone() {
            return Err(ApiError::Gone(object.into()));
        }
        object.merge_shallow(fields);
        object.set_str("updated", &now.to_string());
        self.upsert(b, &object)?;
        Ok(object)
    }

    /// Transition the row to a Tombstone preserving its identity.
    pub(crate) fn tombstone(
        &self,
        b: &mut Batch,
        iri: &str,
        now: Timestamp,
    ) -> Result<Object, ApiError> {
        let object = self.find_one(iri)?.ok_or(ApiError::NotFound)?;
        if object.is_tombstone() {
            return Err(ApiError::Gone(object.into()));
        }
        let tombstone = object.into_tombstone(now);
        self.upsert(b, &tombstone)?;
        Ok(tombstone)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use fjall::{Config, Keyspace};
    use serde_json::json;
    use tempfile::tempdir;

    use crate::error::ApiError;

    use super::{Object, ObjectRepo};

    fn repo() -> Result<(tempfile::TempDir, Keyspace, ObjectRepo)> {
        let tmp_dir = tempdir()?;
        let keyspace = Keyspace::open(Config::new(tmp_dir.path()).temporary(true))?;
        let repo = ObjectRepo::new(keyspace.clone())?;
        Ok((tmp_dir, keyspace, repo))
    }

    #[test]
    fn put_then_find() -> Result<()> {
        let (_tmp, keyspace, repo) = repo()?;
        let note = Object::try_from(json!({
            "id": "https://social.example/note/72",
            "type": "Note",
            "content": "This is a note",
            "to": ["https://www.w3.org/ns/activitystreams#Public"],
        }))?;
        let mut b = keyspace.batch();
        repo.put(&mut b, &note).unwrap();
        b.commit()?;
        assert_eq!(Some(note), repo.find_one("https://social.example/note/72")?);
        Ok(())
    }

    #[test]
    fn duplicate_put_conflicts() -> Result<()> {
        let (_tmp, keyspace, repo) = repo()?;
        let note = Object::try_from(json!({
            "id": "https://social.example/note/72",
            "type": "Note",
        }))?;
        let mut b = keyspace.batch();
        repo.put(&mut b, &note).unwrap();
        b.commit()?;
        let mut b = keyspace.batch();
        assert!(matches!(
            repo.put(&mut b, &note),
            Err(ApiError::Conflict(_))
        ));
        Ok(())
    }

    #[test]
    fn patch_after_tombstone_is_gone() -> Result<()> {
        let (_tmp, keyspace, repo) = repo()?;
        let note = Object::try_from(json!({
            "id": "https://social.example/note/72",
            "type": "Note",
            "content": "soon gone",
        }))?;
        let mut b = keyspace.batch();
        repo.put(&mut b, &note).unwrap();
        b.commit()?;

        let now = jiff::Timestamp::now();
        let mut b = keyspace.batch();
        let tombstone = repo.tombstone(&mut b, "https://social.example/note/72", now).unwrap();
        b.commit()?;
        assert_eq!(tombstone.get_str("formerType"), Some("Note"));

        let mut b = keyspace.batch();
        let fields = json!({"content": "resurrected"});
        let result = repo.patch(
            &mut b,
            "https://social.example/note/72",
            fields.as_object().unwrap(),
            now,
        );
        assert!(matches!(result, Err(ApiError::Gone(_))));
        Ok(())
    }
}
