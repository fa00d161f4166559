use anyhow::{Context, Result};
use fjall::{Batch, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde_json::{Value, json};

use crate::activity_pub::model::{Collection, CollectionPage, Object};
use crate::activity_pub::random_token;

use super::ObjectRepo;

/// Append-only ordered collections, stored as object rows (one row for the
/// collection, one per page) plus a membership index for O(1) `contains`.
///
/// Ordering is strictly LIFO: the first page always holds the newest items,
/// and a full first page is rotated behind a fresh one.
#[derive(Clone)]
pub(crate) struct CollectionStore {
    objects: ObjectRepo,
    members: PartitionHandle,
    base_url: String,
    page_size: usize,
}

fn member_key(coll_iri: &str, item_iri: &str) -> Vec<u8> {
    let mut key = vec![];
    key.extend_from_slice(coll_iri.as_bytes());
    key.push(0);
    key.extend_from_slice(item_iri.as_bytes());
    key
}

impl CollectionStore {
    pub(crate) fn new(
        keyspace: Keyspace,
        base_url: impl Into<String>,
        page_size: usize,
    ) -> Result<CollectionStore> {
        let objects = ObjectRepo::new(keyspace.clone())?;
        let members =
            keyspace.open_partition("collection_members", PartitionCreateOptions::default())?;
        Ok(CollectionStore {
            objects,
            members,
            base_url: base_url.into(),
            page_size,
        })
    }

    /// Mint a collection with one empty page, returning the collection row.
    /// Private collections carry no addressing so only their owner passes
    /// the read rule.
    pub(crate) fn create(
        &self,
        b: &mut Batch,
        owner: &str,
        name_map: Option<Value>,
        public: bool,
    ) -> Result<Object> {
        let coll_iri = format!("{}/orderedcollection/{}", self.base_url, random_token());
        let page_iri = format!("{}/orderedcollectionpage/{}", self.base_url, random_token());
        let mut coll = Collection::new_ordered(&coll_iri, owner)
            .first(&page_iri)
            .last(&page_iri);
        if let Some(name_map) = name_map {
            coll = coll.name_map(name_map);
        }
        if public {
            coll = coll.public();
        }
        let coll = coll.build();
        let page = CollectionPage::new(&page_iri, &coll_iri, owner)
            .addressing_of(&coll)
            .build();
        self.objects.upsert(b, &coll)?;
        self.objects.upsert(b, &page)?;
        Ok(coll)
    }

    /// Prepend `item_iri`; idempotent by item IRI. Returns false when the
    /// item was already present.
    pub(crate) fn append(&self, b: &mut Batch, coll_iri: &str, item_iri: &str) -> Result<bool> {
        if self.contains(coll_iri, item_iri)? {
            return Ok(false);
        }
        let mut coll = self
            .objects
            .find_one(coll_iri)?
            .with_context(|| format!("no such collection {coll_iri}"))?;
        let first_iri = coll
            .get_str("first")
            .context("collection must have a first page")?
            .to_string();
        let mut first = self
            .objects
            .find_one(&first_iri)?
            .with_context(|| format!("missing collection page {first_iri}"))?;
        let mut items = first
            .get_value("orderedItems")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if items.len() >= self.page_size {
            let owner = coll.attributed_to().unwrap_or_default().to_string();
            let new_iri = format!("{}/orderedcollectionpage/{}", self.base_url, random_token());
            let mut new_first = CollectionPage::new(&new_iri, coll_iri, &owner)
                .next(&first_iri)
                .addressing_of(&coll)
                .build();
            new_first.set("orderedItems", json!([item_iri]));
            first.set_str("prev", &new_iri);
            coll.set_str("first", &new_iri);
            self.objects.upsert(b, &new_first)?;
            self.objects.upsert(b, &first)?;
        } else {
            items.insert(0, Value::String(item_iri.to_string()));
            first.set("orderedItems", Value::Array(items));
            self.objects.upsert(b, &first)?;
        }

        let total = total_items(&coll) + 1;
        coll.set("totalItems", json!(total));
        self.objects.upsert(b, &coll)?;
        b.insert(&self.members, member_key(coll_iri, item_iri), []);
        Ok(true)
    }

    /// Remove `item_iri` wherever it sits in the page chain. Returns false
    /// when the item was not present.
    pub(crate) fn remove(&self, b: &mut Batch, coll_iri: &str, item_iri: &str) -> Result<bool> {
        if !self.contains(coll_iri, item_iri)? {
            return Ok(false);
        }
        let mut coll = self
            .objects
            .find_one(coll_iri)?
            .with_context(|| format!("no such collection {coll_iri}"))?;
        let mut page_iri = coll.get_str("first").map(str::to_string);
        while let Some(iri) = page_iri {
            let mut page = self
                .objects
                .find_one(&iri)?
                .with_context(|| format!("missing collection page {iri}"))?;
            let mut items = page
                .get_value("orderedItems")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let before = items.len();
            items.retain(|item| item.as_str() != Some(item_iri));
            if items.len() != before {
                page.set("orderedItems", Value::Array(items));
                self.objects.upsert(b, &page)?;
                break;
            }
            page_iri = page.get_str("next").map(str::to_string);
        }
        let total = total_items(&coll).saturating_sub(1);
        coll.set("totalItems", json!(total));
        self.objects.upsert(b, &coll)?;
        b.remove(&self.members, member_key(coll_iri, item_iri));
        Ok(true)
    }

    pub(crate) fn contains(&self, coll_iri: &str, item_iri: &str) -> Result<bool> {
        Ok(self.members.contains_key(member_key(coll_iri, item_iri))?)
    }

    /// Every member IRI, in storage order. Used for inlining local
    /// followers/following into an audience.
    pub(crate) fn members(&self, coll_iri: &str) -> Result<Vec<String>> {
        let mut prefix = coll_iri.as_bytes().to_vec();
        prefix.push(0);
        let mut members = vec![];
        for pair in self.members.prefix(prefix) {
            let (key, _) = pair?;
            let item = key
                .split(|&byte| byte == 0)
                .nth(1)
                .context("member key should be NUL delimited")?;
            members.push(String::from_utf8(item.to_vec())?);
        }
        Ok(members)
    }
}

fn total_items(coll: &Object) -> u64 {
    coll.get_value("totalItems")
        .and_then(Value::as_u64)
        .unwrap_or(0)
}
