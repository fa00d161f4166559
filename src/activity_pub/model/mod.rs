mod actor;
mod collection;
mod create;
mod json_ld;
mod object;

pub(crate) use actor::{Actor, ActorCollections, local_person};
pub(crate) use collection::{Collection, CollectionPage};
pub(crate) use create::Create;
pub(crate) use json_ld::JsonLdValue;
pub(crate) use object::Object;
