//! Audience expansion: turning `to`/`cc`/`bto`/`bcc`/`audience` into a
//! concrete set of actor IRIs.

use anyhow::Result;
use tracing::warn;

use super::model::JsonLdValue;
use super::repo::{CollectionStore, ObjectRepo};
use super::{Mailman, PUBLIC_IRI};

/// A resolved recipient set. `public` is set when the Public IRI appeared
/// anywhere in the addressing.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Audience {
    pub(crate) actors: Vec<String>,
    pub(crate) public: bool,
}

impl Audience {
    fn push(&mut self, iri: String) {
        if !self.actors.contains(&iri) {
            self.actors.push(iri);
        }
    }

    pub(crate) fn contains(&self, iri: &str) -> bool {
        self.actors.iter().any(|actor| actor == iri)
    }
}

pub(crate) struct Resolver {
    objects: ObjectRepo,
    collections: CollectionStore,
    base_url: String,
}

impl Resolver {
    pub(crate) fn new(
        objects: ObjectRepo,
        collections: CollectionStore,
        base_url: impl Into<String>,
    ) -> Resolver {
        Resolver {
            objects,
            collections,
            base_url: base_url.into(),
        }
    }

    /// Network-free expansion, used on every read-authorization check.
    /// Local collections are inlined shallowly; remote IRIs stay opaque
    /// actor references (a remote collection we cannot dereference here is
    /// treated as empty).
    pub(crate) fn expand_local(&self, iris: &[String]) -> Result<Audience> {
        let mut audience = Audience::default();
        for iri in iris {
            if iri == PUBLIC_IRI {
                audience.public = true;
            } else if iri.starts_with(&self.base_url) {
                self.expand_local_iri(iri, &mut audience)?;
            } else {
                audience.push(iri.clone());
            }
        }
        Ok(audience)
    }

    /// Delivery-time expansion: remote IRIs are dereferenced once so remote
    /// collections can be inlined. No recursion into collections of
    /// collections; a failed dereference leaves the IRI as a plain actor
    /// recipient so the delivery queue can still try it.
    pub(crate) async fn expand_for_delivery(
        &self,
        iris: &[String],
        mailman: &Mailman,
    ) -> Result<Audience> {
        let mut audience = Audience::default();
        for iri in iris {
            if iri == PUBLIC_IRI {
                audience.public = true;
            } else if iri.starts_with(&self.base_url) {
                self.expand_local_iri(iri, &mut audience)?;
            } else {
                match mailman.fetch(iri).await {
                    Ok(value)
                        if value.type_is("Collection")
                            || value.type_is("OrderedCollection") =>
                    {
                        for item in value
                            .iri_values("items")
                            .into_iter()
                            .chain(value.iri_values("orderedItems"))
                        {
                            if item != PUBLIC_IRI {
                                audience.push(item);
                            }
                        }
                    }
                    Ok(_) => audience.push(iri.clone()),
                    Err(error) => {
                        warn!(target: "apub", %iri, %error, "audience dereference failed");
                        audience.push(iri.clone());
                    }
                }
            }
        }
        Ok(audience)
    }

    fn expand_local_iri(&self, iri: &str, audience: &mut Audience) -> Result<()> {
        match self.objects.find_one(iri)? {
            Some(row) if row.type_is("OrderedCollection") || row.type_is("Collection") => {
                for member in self.collections.members(iri)? {
                    if member != PUBLIC_IRI {
                        audience.push(member);
                    }
                }
            }
            _ => audience.push(iri.to_string()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use fjall::{Config, Keyspace};
    use tempfile::tempdir;

    use crate::activity_pub::PUBLIC_IRI;
    use crate::activity_pub::repo::{CollectionStore, ObjectRepo};

    use super::Resolver;

    const BASE: &str = "https://social.example";

    fn resolver() -> Result<(tempfile::TempDir, Keyspace, Resolver)> {
        let tmp_dir = tempdir()?;
        let keyspace = Keyspace::open(Config::new(tmp_dir.path()).temporary(true))?;
        let objects = ObjectRepo::new(keyspace.clone())?;
        let collections = CollectionStore::new(keyspace.clone(), BASE, 20)?;
        let resolver = Resolver::new(objects, collections, BASE);
        Ok((tmp_dir, keyspace, resolver))
    }

    #[test]
    fn public_and_plain_actors() -> Result<()> {
        let (_tmp, _keyspace, resolver) = resolver()?;
        let audience = resolver.expand_local(&[
            PUBLIC_IRI.to_string(),
            "https://remote.example/person/bob".to_string(),
            "https://remote.example/person/bob".to_string(),
        ])?;
        assert!(audience.public);
        assert_eq!(audience.actors, vec!["https://remote.example/person/bob"]);
        Ok(())
    }

    #[test]
    fn local_collections_are_inlined_shallowly() -> Result<()> {
        let (_tmp, keyspace, resolver) = resolver()?;
        let collections = CollectionStore::new(keyspace.clone(), BASE, 20)?;
        let mut b = keyspace.batch();
        let followers = collections.create(&mut b, "https://social.example/person/a", None, true)?;
        let followers = followers.id().unwrap().to_string();
        let nested = collections.create(&mut b, "https://social.example/person/a", None, true)?;
        let nested = nested.id().unwrap().to_string();
        b.commit()?;
        let mut b = keyspace.batch();
        collections.append(&mut b, &followers, "https://social.example/person/b")?;
        b.commit()?;
        // a collection member inside a collection is not recursed into
        let mut b = keyspace.batch();
        collections.append(&mut b, &followers, &nested)?;
        b.commit()?;

        let audience = resolver.expand_local(&[followers.clone()])?;
        assert!(!audience.public);
        assert!(audience.contains("https://social.example/person/b"));
        assert!(audience.contains(&nested));
        assert_eq!(audience.actors.len(), 2);
        Ok(())
    }

    #[test]
    fn unknown_local_iri_is_an_actor() -> Result<()> {
        let (_tmp, _keyspace, resolver) = resolver()?;
        let audience =
            resolver.expand_local(&["https://social.example/person/ghost".to_string()])?;
        assert_eq!(audience.actors, vec!["https://social.example/person/ghost"]);
        Ok(())
    }
}
