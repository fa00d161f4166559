//! Per-(object, viewer) read authorization. The same predicate guards
//! single-object GETs and filters every collection page enumeration.

use anyhow::Result;

use crate::error::ApiError;

use super::addressing::Resolver;
use super::model::{Actor, Object};
use super::repo::{CollectionStore, ObjectRepo};

pub(crate) struct Authz {
    objects: ObjectRepo,
    collections: CollectionStore,
    resolver: Resolver,
}

impl Authz {
    pub(crate) fn new(
        objects: ObjectRepo,
        collections: CollectionStore,
        base_url: impl Into<String>,
    ) -> Authz {
        let base_url = base_url.into();
        let resolver = Resolver::new(objects.clone(), collections.clone(), base_url);
        Authz {
            objects,
            collections,
            resolver,
        }
    }

    /// The read rule, applied in order:
    /// 1. the author always reads their own objects;
    /// 2. a viewer blocked by the author is denied even on public objects;
    /// 3. addressing opens the object to the world (Public) or to addressed
    ///    viewers;
    /// 4. ambient objects with no author are world-readable;
    /// 5. everything else is denied, 401 anonymous and 403 otherwise.
    ///
    /// The private `blocked` collection needs no extra case: it carries no
    /// addressing, so only its owner passes.
    pub(crate) fn can_read(&self, viewer: Option<&str>, object: &Object) -> Result<(), ApiError> {
        let author = object.attributed_to();
        if author.is_some() && author == viewer {
            return Ok(());
        }
        if let (Some(author), Some(viewer_iri)) = (author, viewer) {
            if self.is_blocked_by(author, viewer_iri)? {
                return Err(ApiError::Forbidden);
            }
        }

        let mut addressed = vec![];
        for prop in ["to", "cc", "audience"] {
            for iri in object.iris(prop) {
                if !addressed.contains(&iri) {
                    addressed.push(iri);
                }
            }
        }
        let audience = self.resolver.expand_local(&addressed)?;
        if audience.public {
            return Ok(());
        }
        if let Some(viewer_iri) = viewer {
            if audience.contains(viewer_iri) {
                return Ok(());
            }
        }
        if object.attributed_to().is_none() {
            return Ok(());
        }
        match viewer {
            None => Err(ApiError::Unauthorized),
            Some(_) => Err(ApiError::Forbidden),
        }
    }

    /// Inbox acceptance: a sender blocked by the inbox owner is refused.
    pub(crate) fn accepts_delivery(&self, owner_iri: &str, sender_iri: &str) -> Result<bool> {
        Ok(!self.is_blocked_by(owner_iri, sender_iri)?)
    }

    /// Whether `subject_iri` sits in the blocked collection of the local
    /// actor `actor_iri`. Remote actors keep their block lists to
    /// themselves; we can only consult our own.
    pub(crate) fn is_blocked_by(&self, actor_iri: &str, subject_iri: &str) -> Result<bool> {
        let Some(person) = self.objects.find_one(actor_iri)? else {
            return Ok(false);
        };
        let actor = Actor::from(person);
        let Some(blocked) = actor.blocked() else {
            return Ok(false);
        };
        self.collections.contains(blocked, subject_iri)
    }
}
