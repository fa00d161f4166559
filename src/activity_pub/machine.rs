//! The activity side-effect engine. Every graph mutation (registration,
//! C2S outbox posts, S2S inbox deliveries) runs through this single-writer
//! actor, so collection appends are serialized and each activity commits in
//! one atomic batch or not at all.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use fjall::{Batch, Keyspace, PersistMode};
use jiff::Timestamp;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde_json::{Value, json};
use tokio::task::spawn_blocking;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::ApiError;

use super::addressing::Resolver;
use super::authz::Authz;
use super::delivery::DeliveryQueueItem;
use super::model::{
    Actor as AsActor, ActorCollections, Create, JsonLdValue, Object, local_person,
};
use super::repo::{Account, AccountRepo, CollectionStore, ObjectRepo, hash_password};
use super::simple_queue::SimpleQueue;
use super::{Mailman, hs2019, mint_iri, random_token};

pub(crate) const MACHINE_NAME: &str = "apub_machine";

pub(crate) struct ActivityPubMachine;

pub(crate) struct ActivityPubMachineInit {
    pub(crate) config: Config,
    pub(crate) keyspace: Keyspace,
}

pub(crate) struct State {
    base_url: String,
    keyspace: Keyspace,
    objects: ObjectRepo,
    collections: CollectionStore,
    accounts: AccountRepo,
    resolver: Resolver,
    authz: Authz,
    queue: SimpleQueue,
    mailman: Mailman,
}

#[derive(Debug, Clone)]
pub(crate) struct RegisterRequest {
    pub(crate) username: String,
    pub(crate) password: String,
    pub(crate) confirmation: String,
}

#[derive(Debug, Clone)]
pub(crate) struct Registered {
    pub(crate) username: String,
    pub(crate) actor_iri: String,
    pub(crate) token: String,
}

#[derive(Debug)]
pub(crate) struct OutboxRequest {
    pub(crate) username: String,
    pub(crate) payload: Value,
}

#[derive(Debug)]
pub(crate) struct InboxRequest {
    pub(crate) owner_username: String,
    pub(crate) sender_iri: String,
    pub(crate) activity: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InboxOutcome {
    Stored,
    Duplicate,
}

pub(crate) enum MachineMsg {
    Register(RegisterRequest, RpcReplyPort<Result<Registered, ApiError>>),
    OutboxPost(OutboxRequest, RpcReplyPort<Result<Value, ApiError>>),
    InboxPost(InboxRequest, RpcReplyPort<Result<InboxOutcome, ApiError>>),
}

/// Locate the running machine through the actor registry; the supervisor
/// respawns it under the same name after a crash.
pub(crate) fn get_machine() -> Result<ActorRef<MachineMsg>> {
    let cell = ractor::registry::where_is(MACHINE_NAME.to_string())
        .context("activity pub machine is not running")?;
    Ok(cell.into())
}

impl Actor for ActivityPubMachine {
    type Msg = MachineMsg;
    type State = State;
    type Arguments = ActivityPubMachineInit;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let ActivityPubMachineInit { config, keyspace } = args;
        let base_url = config.base_url();
        let page_size = config.page_size;
        spawn_blocking(move || {
            let objects = ObjectRepo::new(keyspace.clone())?;
            let collections = CollectionStore::new(keyspace.clone(), &base_url, page_size)?;
            let accounts = AccountRepo::new(keyspace.clone())?;
            let resolver = Resolver::new(objects.clone(), collections.clone(), &base_url);
            let authz = Authz::new(objects.clone(), collections.clone(), &base_url);
            let queue = SimpleQueue::new(keyspace.clone())?;
            Ok(State {
                base_url,
                keyspace,
                objects,
                collections,
                accounts,
                resolver,
                authz,
                queue,
                mailman: Mailman::new(),
            })
        })
        .await
        .context("Failed to create ActivityPubMachine")?
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            MachineMsg::Register(request, reply) => {
                let result = state.handle_register(request).await;
                let _ = reply.send(result);
            }
            MachineMsg::OutboxPost(request, reply) => {
                let result = state.handle_outbox(request).await;
                let _ = reply.send(result);
            }
            MachineMsg::InboxPost(request, reply) => {
                let result = state.handle_inbox(request).await;
                let _ = reply.send(result);
            }
        }
        Ok(())
    }
}

fn valid_username(username: &str) -> bool {
    !username.is_empty()
        && username.len() <= 32
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl State {
    async fn handle_register(&mut self, request: RegisterRequest) -> Result<Registered, ApiError> {
        let RegisterRequest {
            username,
            password,
            confirmation,
        } = request;
        if !valid_username(&username) {
            return Err(ApiError::bad_request(
                "username must match [A-Za-z0-9_]{1,32}",
            ));
        }
        if password.is_empty() || password != confirmation {
            return Err(ApiError::bad_request("passwords do not match"));
        }
        if self.accounts.exists(&username)? {
            return Err(ApiError::Conflict(format!(
                "username {username} is already taken"
            )));
        }

        let (private_der, public_der) = spawn_blocking(hs2019::generate_key_pair)
            .await
            .map_err(anyhow::Error::from)??;
        let password_phc = {
            let password = password.clone();
            spawn_blocking(move || hash_password(&password))
                .await
                .map_err(anyhow::Error::from)??
        };

        let actor_iri = format!("{}/person/{}", self.base_url, random_token());
        let key_iri = mint_iri(&self.base_url, "Key");
        let token = format!("{}{}", random_token(), random_token());

        let mut b = self.keyspace.batch().durability(Some(PersistMode::SyncAll));
        let collections = ActorCollections {
            inbox: self.create_collection(&mut b, &actor_iri, "inbox", true)?,
            outbox: self.create_collection(&mut b, &actor_iri, "outbox", true)?,
            followers: self.create_collection(&mut b, &actor_iri, "followers", true)?,
            following: self.create_collection(&mut b, &actor_iri, "following", true)?,
            liked: self.create_collection(&mut b, &actor_iri, "liked", true)?,
            blocked: self.create_collection(&mut b, &actor_iri, "blocked", false)?,
        };

        let person = local_person(&actor_iri, &username, &collections, &key_iri, &public_der);
        let key = Object::try_from(json!({
            "id": key_iri,
            "type": "Key",
            "owner": actor_iri,
            "publicKeyPem": person
                .get_value("publicKey")
                .and_then(|k| k.get("publicKeyPem"))
                .cloned()
                .unwrap_or(Value::Null),
            "to": [super::PUBLIC_IRI],
        }))
        .map_err(anyhow::Error::from)?;

        let account = Account {
            username: username.clone(),
            password_phc,
            token: token.clone(),
            actor_iri: actor_iri.clone(),
            inbox: collections.inbox.clone(),
            outbox: collections.outbox.clone(),
            key_iri,
            private_key_der: private_der,
        };

        self.objects.put(&mut b, &person)?;
        self.objects.put(&mut b, &key)?;
        self.accounts.insert(&mut b, &account)?;
        b.commit().map_err(anyhow::Error::from)?;

        info!(target: "apub", %username, %actor_iri, "registered local actor");
        Ok(Registered {
            username,
            actor_iri,
            token,
        })
    }

    fn create_collection(
        &self,
        b: &mut Batch,
        owner: &str,
        name: &str,
        public: bool,
    ) -> Result<String, ApiError> {
        let name_map = json!({"en": name});
        let coll = self
            .collections
            .create(b, owner, Some(name_map), public)?;
        Ok(coll.id().expect("collection rows have ids").to_string())
    }

    async fn handle_outbox(&mut self, request: OutboxRequest) -> Result<Value, ApiError> {
        let OutboxRequest { username, payload } = request;
        let account = self
            .accounts
            .find_by_username(&username)?
            .ok_or(ApiError::Unauthorized)?;
        let actor_iri = account.actor_iri.clone();

        let payload =
            Object::try_from(payload).map_err(|_| ApiError::bad_request("payload must be a JSON object"))?;
        let mut activity: Object = if payload.is_activity() && !payload.type_is("Create") {
            payload
        } else {
            Create::try_from(payload)
                .map_err(|error| ApiError::bad_request(error.to_string()))?
                .into()
        };

        if let Some(client_id) = activity.id() {
            if self.objects.contains(client_id)? {
                return Err(ApiError::Conflict(format!("{client_id} already exists")));
            }
        }

        let now = Timestamp::now();
        let act_type = activity
            .obj_type()
            .unwrap_or("IntransitiveActivity")
            .to_string();
        let act_iri = mint_iri(&self.base_url, &act_type);
        activity.set_id(&act_iri);
        activity.set_str("actor", &actor_iri);
        activity.set_str("attributedTo", &actor_iri);
        activity.stamp_times(now);

        let mut b = self.keyspace.batch().durability(Some(PersistMode::SyncAll));
        match act_type.as_str() {
            "Create" => self.apply_create(&mut b, &mut activity, &actor_iri, now)?,
            "Update" => self.apply_update(&mut b, &mut activity, &actor_iri, now)?,
            "Delete" => self.apply_delete(&mut b, &mut activity, &actor_iri, now)?,
            "Follow" => self.apply_follow(&mut b, &activity, &actor_iri)?,
            "Add" => self.apply_add(&mut b, &activity, &actor_iri, true)?,
            "Remove" => self.apply_add(&mut b, &activity, &actor_iri, false)?,
            "Like" => self.apply_like(&mut b, &activity, &actor_iri, &act_iri)?,
            "Announce" => self.apply_announce(&mut b, &activity, &act_iri)?,
            "Block" => self.apply_block(&mut b, &activity, &actor_iri)?,
            "Undo" => self.apply_undo(&mut b, &activity, &actor_iri)?,
            // IntransitiveActivity and the rest only store and address
            _ => {}
        }

        // Recipients are resolved before bto/bcc are stripped, and reflect
        // the followers collections as of this commit.
        let audience_iris = activity.audience_iris();
        let audience = self
            .resolver
            .expand_for_delivery(&audience_iris, &self.mailman)
            .await?;

        strip_private_addressing_deep(&mut activity);
        self.objects.put(&mut b, &activity)?;

        let mut local_inboxes = BTreeSet::new();
        let mut remote_actors = BTreeSet::new();
        let block_subject = (act_type == "Block")
            .then(|| activity.object_iri().map(str::to_string))
            .flatten();
        for recipient in &audience.actors {
            if *recipient == actor_iri {
                continue;
            }
            // A Block is hidden from the blocked party even when addressed
            if block_subject.as_deref() == Some(recipient.as_str()) {
                continue;
            }
            if let Some(local) = self.accounts.find_by_actor(recipient)? {
                if self.authz.accepts_delivery(&local.actor_iri, &actor_iri)? {
                    local_inboxes.insert(local.inbox);
                }
            } else {
                remote_actors.insert(recipient.clone());
            }
        }
        // The self-inbox property: the actor always sees their own activity
        local_inboxes.insert(account.inbox.clone());

        self.collections.append(&mut b, &account.outbox, &act_iri)?;
        for inbox in &local_inboxes {
            self.collections.append(&mut b, inbox, &act_iri)?;
        }
        b.commit().map_err(anyhow::Error::from)?;

        for recipient in remote_actors {
            let item = DeliveryQueueItem {
                sender: username.clone(),
                recipient,
                activity: serde_json::to_string(activity.as_ref())
                    .map_err(anyhow::Error::from)?,
                attempts: 0,
            };
            if let Err(error) = self.queue.send_message(&item.to_bytes()?) {
                warn!(target: "apub", %error, "failed to enqueue delivery");
            }
        }

        Ok(activity.into())
    }

    fn apply_create(
        &self,
        b: &mut Batch,
        activity: &mut Object,
        actor_iri: &str,
        now: Timestamp,
    ) -> Result<(), ApiError> {
        let mut create = Create::try_from(activity.clone())
            .map_err(|error| ApiError::bad_request(error.to_string()))?;
        let mut object = create
            .take_object()
            .ok_or_else(|| ApiError::bad_request("Create must carry an object"))?;

        if let Some(client_id) = object.id() {
            if self.objects.contains(client_id)? {
                return Err(ApiError::Conflict(format!("{client_id} already exists")));
            }
        }

        // Addressing is shared between the activity and its object
        for prop in ["to", "cc", "bto", "bcc", "audience"] {
            match (activity.get_value(prop).cloned(), object.get_value(prop).cloned()) {
                (Some(value), None) => object.set(prop, value),
                (None, Some(value)) => activity.set(prop, value),
                _ => {}
            }
        }
        let is_public = object.audience_iris().iter().any(|iri| iri == super::PUBLIC_IRI);

        let obj_type = object.obj_type().unwrap_or("Object").to_string();
        if ["Collection", "OrderedCollection"].contains(&obj_type.as_str()) {
            // Collections are materialized with their page structure
            let name_map = object.get_value("nameMap").cloned();
            let coll = self.collections.create(b, actor_iri, name_map, is_public)?;
            activity.set("object", coll.as_ref().clone());
            return Ok(());
        }

        object.set_id(&mint_iri(&self.base_url, &obj_type));
        object.set_str("attributedTo", actor_iri);
        object.stamp_times(now);
        for backref in ["replies", "likes", "shares"] {
            let coll = self.collections.create(b, actor_iri, None, is_public)?;
            object.set_str(backref, coll.id().expect("collection rows have ids"));
        }
        let mut stored = object.clone();
        stored.strip_private_addressing();
        self.objects.put(b, &stored)?;

        if let Some(parent_iri) = object.get_str("inReplyTo") {
            if parent_iri.starts_with(&self.base_url) {
                if let Some(parent) = self.objects.find_one(parent_iri)? {
                    if let Some(replies) = parent.get_str("replies") {
                        self.collections
                            .append(b, replies, object.id().expect("object id was minted"))?;
                    }
                }
            }
        }

        create.put_object(&object);
        *activity = create.into();
        Ok(())
    }

    fn apply_update(
        &self,
        b: &mut Batch,
        activity: &mut Object,
        actor_iri: &str,
        now: Timestamp,
    ) -> Result<(), ApiError> {
        let Some(Value::Object(fields)) = activity.get_value("object").cloned() else {
            return Err(ApiError::bad_request(
                "Update requires an embedded object with an id",
            ));
        };
        let target_iri = fields
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::bad_request("Update object must carry an id"))?
            .to_string();
        let current = self
            .objects
            .find_one(&target_iri)?
            .ok_or(ApiError::NotFound)?;
        if current.is_tombstone() {
            return Err(ApiError::Gone(current.into()));
        }
        if current.attributed_to() != Some(actor_iri) {
            return Err(ApiError::Forbidden);
        }
        let patched = self.objects.patch(b, &target_iri, &fields, now)?;
        activity.set("object", patched.into());
        Ok(())
    }

    fn apply_delete(
        &self,
        b: &mut Batch,
        activity: &mut Object,
        actor_iri: &str,
        now: Timestamp,
    ) -> Result<(), ApiError> {
        let target_iri = activity
            .object_iri()
            .ok_or_else(|| ApiError::bad_request("Delete requires an object"))?
            .to_string();
        let current = self
            .objects
            .find_one(&target_iri)?
            .ok_or(ApiError::NotFound)?;
        if current.is_tombstone() {
            return Err(ApiError::Gone(current.into()));
        }
        if current.attributed_to() != Some(actor_iri) {
            return Err(ApiError::Forbidden);
        }
        let tombstone = self.objects.tombstone(b, &target_iri, now)?;
        activity.set("object", tombstone.into());
        Ok(())
    }

    fn apply_follow(
        &self,
        b: &mut Batch,
        activity: &Object,
        actor_iri: &str,
    ) -> Result<(), ApiError> {
        let followee_iri = activity
            .object_iri()
            .ok_or_else(|| ApiError::bad_request("Follow requires an object"))?
            .to_string();
        let actor = self.local_actor(actor_iri)?;
        if self.accounts.find_by_actor(&followee_iri)?.is_some() {
            // Local followee: accepted on the spot
            if !self.authz.accepts_delivery(&followee_iri, actor_iri)? {
                return Err(ApiError::Forbidden);
            }
            let followee = self.local_actor(&followee_iri)?;
            if let Some(followers) = followee.followers() {
                self.collections.append(b, followers, actor_iri)?;
            }
            if let Some(following) = actor.following() {
                self.collections.append(b, following, &followee_iri)?;
            }
        }
        // Remote followees confirm with an Accept through our inbox
        Ok(())
    }

    fn apply_add(
        &self,
        b: &mut Batch,
        activity: &Object,
        actor_iri: &str,
        add: bool,
    ) -> Result<(), ApiError> {
        let verb = if add { "Add" } else { "Remove" };
        let target_iri = activity
            .iris("target")
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::bad_request(format!("{verb} requires a target")))?;
        let object_iri = activity
            .object_iri()
            .ok_or_else(|| ApiError::bad_request(format!("{verb} requires an object")))?
            .to_string();
        let target = self
            .objects
            .find_one(&target_iri)?
            .ok_or(ApiError::NotFound)?;
        if !target.type_is("OrderedCollection") && !target.type_is("Collection") {
            return Err(ApiError::bad_request(format!(
                "{verb} target must be a collection"
            )));
        }
        if target.attributed_to() != Some(actor_iri) {
            return Err(ApiError::Forbidden);
        }
        if add {
            self.collections.append(b, &target_iri, &object_iri)?;
        } else {
            self.collections.remove(b, &target_iri, &object_iri)?;
        }
        Ok(())
    }

    fn apply_like(
        &self,
        b: &mut Batch,
        activity: &Object,
        actor_iri: &str,
        act_iri: &str,
    ) -> Result<(), ApiError> {
        let object_iri = activity
            .object_iri()
            .ok_or_else(|| ApiError::bad_request("Like requires an object"))?
            .to_string();
        let target = self.objects.find_one(&object_iri)?;
        if let Some(author) = target.as_ref().and_then(|t| t.attributed_to()) {
            // Observed contract: liking a blocker's object is a 400
            if self.authz.is_blocked_by(author, actor_iri)? {
                return Err(ApiError::bad_request("the author has blocked this actor"));
            }
        }
        let actor = self.local_actor(actor_iri)?;
        if let Some(liked) = actor.liked() {
            self.collections.append(b, liked, &object_iri)?;
        }
        if let Some(likes) = target.as_ref().and_then(|t| t.get_str("likes")) {
            self.collections.append(b, likes, act_iri)?;
        }
        Ok(())
    }

    fn apply_announce(
        &self,
        b: &mut Batch,
        activity: &Object,
        act_iri: &str,
    ) -> Result<(), ApiError> {
        let object_iri = activity
            .object_iri()
            .ok_or_else(|| ApiError::bad_request("Announce requires an object"))?
            .to_string();
        if let Some(target) = self.objects.find_one(&object_iri)? {
            if let Some(shares) = target.get_str("shares") {
                self.collections.append(b, shares, act_iri)?;
            }
        }
        Ok(())
    }

    fn apply_block(
        &self,
        b: &mut Batch,
        activity: &Object,
        actor_iri: &str,
    ) -> Result<(), ApiError> {
        let subject_iri = activity
            .object_iri()
            .ok_or_else(|| ApiError::bad_request("Block requires an object"))?
            .to_string();
        let actor = self.local_actor(actor_iri)?;
        if let Some(blocked) = actor.blocked() {
            self.collections.append(b, blocked, &subject_iri)?;
        }
        if let Some(followers) = actor.followers() {
            self.collections.remove(b, followers, &subject_iri)?;
        }
        if let Some(following) = actor.following() {
            self.collections.remove(b, following, &subject_iri)?;
        }
        if self.accounts.find_by_actor(&subject_iri)?.is_some() {
            let subject = self.local_actor(&subject_iri)?;
            if let Some(their_following) = subject.following() {
                self.collections.remove(b, their_following, actor_iri)?;
            }
            if let Some(their_followers) = subject.followers() {
                self.collections.remove(b, their_followers, actor_iri)?;
            }
        }
        Ok(())
    }

    fn apply_undo(
        &self,
        b: &mut Batch,
        activity: &Object,
        actor_iri: &str,
    ) -> Result<(), ApiError> {
        let prior_iri = activity
            .object_iri()
            .ok_or_else(|| ApiError::bad_request("Undo requires an object"))?
            .to_string();
        let prior = self
            .objects
            .find_one(&prior_iri)?
            .ok_or(ApiError::NotFound)?;
        let prior_actor = prior
            .get_str("actor")
            .or_else(|| prior.attributed_to());
        if prior_actor != Some(actor_iri) {
            return Err(ApiError::Forbidden);
        }
        let actor = self.local_actor(actor_iri)?;
        let undone_iri = prior.object_iri().map(str::to_string);
        match prior.obj_type() {
            Some("Like") => {
                let object_iri =
                    undone_iri.ok_or_else(|| ApiError::bad_request("prior Like has no object"))?;
                if let Some(liked) = actor.liked() {
                    self.collections.remove(b, liked, &object_iri)?;
                }
                if let Some(target) = self.objects.find_one(&object_iri)? {
                    if let Some(likes) = target.get_str("likes") {
                        self.collections.remove(b, likes, &prior_iri)?;
                    }
                }
            }
            Some("Follow") => {
                let followee_iri =
                    undone_iri.ok_or_else(|| ApiError::bad_request("prior Follow has no object"))?;
                if let Some(following) = actor.following() {
                    self.collections.remove(b, following, &followee_iri)?;
                }
                if self.accounts.find_by_actor(&followee_iri)?.is_some() {
                    let followee = self.local_actor(&followee_iri)?;
                    if let Some(followers) = followee.followers() {
                        self.collections.remove(b, followers, actor_iri)?;
                    }
                }
            }
            Some("Block") => {
                let subject_iri =
                    undone_iri.ok_or_else(|| ApiError::bad_request("prior Block has no object"))?;
                if let Some(blocked) = actor.blocked() {
                    self.collections.remove(b, blocked, &subject_iri)?;
                }
            }
            other => {
                return Err(ApiError::bad_request(format!(
                    "cannot undo an activity of type {other:?}"
                )));
            }
        }
        Ok(())
    }

    async fn handle_inbox(&mut self, request: InboxRequest) -> Result<InboxOutcome, ApiError> {
        let InboxRequest {
            owner_username,
            sender_iri,
            activity,
        } = request;
        let account = self
            .accounts
            .find_by_username(&owner_username)?
            .ok_or(ApiError::NotFound)?;
        let mut activity = Object::try_from(activity)
            .map_err(|_| ApiError::bad_request("payload must be a JSON object"))?;
        if !activity.as_ref().has_props(&["id", "type"]) {
            return Err(ApiError::bad_request(
                "delivered activity must have id and type",
            ));
        }
        let act_iri = activity
            .id()
            .ok_or_else(|| ApiError::bad_request("delivered activity must have an id"))?
            .to_string();

        // At-most-once visible delivery
        if self.collections.contains(&account.inbox, &act_iri)? {
            return Ok(InboxOutcome::Duplicate);
        }
        if !self.authz.accepts_delivery(&account.actor_iri, &sender_iri)? {
            return Err(ApiError::Forbidden);
        }
        if let Some(claimed) = activity.iris("actor").into_iter().next() {
            if claimed != sender_iri {
                return Err(ApiError::Forbidden);
            }
        }

        let mut b = self.keyspace.batch().durability(Some(PersistMode::SyncAll));
        strip_private_addressing_deep(&mut activity);
        if !self.objects.contains(&act_iri)? {
            self.objects.upsert(&mut b, &activity)?;
        }

        let mut accept: Option<Object> = None;
        match activity.obj_type() {
            Some("Create") => self.receive_create(&mut b, &activity, &sender_iri)?,
            Some("Follow") => {
                accept = self.receive_follow(&mut b, &activity, &account, &sender_iri)?;
            }
            Some("Accept") => self.receive_accept(&mut b, &activity, &account)?,
            Some("Like") => self.receive_like(&mut b, &activity, &act_iri)?,
            Some("Announce") => {
                if let Some(object_iri) = activity.object_iri() {
                    if let Some(target) = self.objects.find_one(object_iri)? {
                        if let Some(shares) = target.get_str("shares") {
                            self.collections.append(&mut b, shares, &act_iri)?;
                        }
                    }
                }
            }
            Some("Undo") => self.receive_undo(&mut b, &activity, &account, &sender_iri)?,
            Some("Delete") => self.receive_delete(&mut b, &activity, &sender_iri)?,
            Some("Update") => self.receive_update(&mut b, &activity, &sender_iri)?,
            // Everything else is only stored and surfaced in the inbox
            _ => {}
        }

        self.collections.append(&mut b, &account.inbox, &act_iri)?;
        b.commit().map_err(anyhow::Error::from)?;

        if let Some(accept) = accept {
            let item = DeliveryQueueItem {
                sender: owner_username,
                recipient: sender_iri,
                activity: serde_json::to_string(accept.as_ref()).map_err(anyhow::Error::from)?,
                attempts: 0,
            };
            if let Err(error) = self.queue.send_message(&item.to_bytes()?) {
                warn!(target: "apub", %error, "failed to enqueue Accept delivery");
            }
        }
        Ok(InboxOutcome::Stored)
    }

    fn receive_create(
        &self,
        b: &mut Batch,
        activity: &Object,
        sender_iri: &str,
    ) -> Result<(), ApiError> {
        let Some(embedded) = activity.get_value("object").cloned() else {
            return Ok(());
        };
        let Ok(mut object) = Object::try_from(embedded) else {
            return Ok(());
        };
        let Some(obj_iri) = object.id().map(str::to_string) else {
            return Ok(());
        };
        if self.objects.contains(&obj_iri)? {
            return Ok(());
        }
        if object.attributed_to().is_none() {
            object.set_str("attributedTo", sender_iri);
        }
        object.strip_private_addressing();
        self.objects.upsert(b, &object)?;
        if let Some(parent_iri) = object.get_str("inReplyTo") {
            if parent_iri.starts_with(&self.base_url) {
                if let Some(parent) = self.objects.find_one(parent_iri)? {
                    if let Some(replies) = parent.get_str("replies") {
                        self.collections.append(b, replies, &obj_iri)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn receive_follow(
        &self,
        b: &mut Batch,
        activity: &Object,
        account: &Account,
        sender_iri: &str,
    ) -> Result<Option<Object>, ApiError> {
        let Some(followee_iri) = activity.object_iri() else {
            return Ok(None);
        };
        if followee_iri != account.actor_iri {
            return Ok(None);
        }
        let owner = self.local_actor(&account.actor_iri)?;
        if let Some(followers) = owner.followers() {
            self.collections.append(b, followers, sender_iri)?;
        }
        // Auto-accept, delivered back to the remote follower
        let accept_iri = mint_iri(&self.base_url, "Accept");
        let now = Timestamp::now().to_string();
        let accept = Object::try_from(json!({
            "id": accept_iri,
            "type": "Accept",
            "actor": account.actor_iri,
            "attributedTo": account.actor_iri,
            "to": [sender_iri],
            "object": activity.as_ref().clone(),
            "published": now,
            "updated": now,
        }))
        .map_err(anyhow::Error::from)?;
        self.objects.put(b, &accept)?;
        Ok(Some(accept))
    }

    fn receive_accept(
        &self,
        b: &mut Batch,
        activity: &Object,
        account: &Account,
    ) -> Result<(), ApiError> {
        let Some(follow_iri) = activity.object_iri() else {
            return Ok(());
        };
        let Some(follow) = self.objects.find_one(follow_iri)? else {
            return Ok(());
        };
        if !follow.type_is("Follow") {
            return Ok(());
        }
        let follow_actor = follow.get_str("actor").or_else(|| follow.attributed_to());
        if follow_actor != Some(account.actor_iri.as_str()) {
            return Ok(());
        }
        let Some(followee_iri) = follow.object_iri() else {
            return Ok(());
        };
        let owner = self.local_actor(&account.actor_iri)?;
        if let Some(following) = owner.following() {
            self.collections.append(b, following, followee_iri)?;
        }
        Ok(())
    }

    fn receive_like(&self, b: &mut Batch, activity: &Object, act_iri: &str) -> Result<(), ApiError> {
        let Some(object_iri) = activity.object_iri() else {
            return Ok(());
        };
        if let Some(target) = self.objects.find_one(object_iri)? {
            if let Some(likes) = target.get_str("likes") {
                self.collections.append(b, likes, act_iri)?;
            }
        }
        Ok(())
    }

    fn receive_undo(
        &self,
        b: &mut Batch,
        activity: &Object,
        account: &Account,
        sender_iri: &str,
    ) -> Result<(), ApiError> {
        let Some(prior_iri) = activity.object_iri() else {
            return Ok(());
        };
        let Some(prior) = self.objects.find_one(prior_iri)? else {
            return Ok(());
        };
        let prior_actor = prior.get_str("actor").or_else(|| prior.attributed_to());
        if prior_actor != Some(sender_iri) {
            return Ok(());
        }
        match prior.obj_type() {
            Some("Like") => {
                if let Some(object_iri) = prior.object_iri() {
                    if let Some(target) = self.objects.find_one(object_iri)? {
                        if let Some(likes) = target.get_str("likes") {
                            self.collections.remove(b, likes, prior_iri)?;
                        }
                    }
                }
            }
            Some("Follow") => {
                let owner = self.local_actor(&account.actor_iri)?;
                if let Some(followers) = owner.followers() {
                    self.collections.remove(b, followers, sender_iri)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn receive_delete(
        &self,
        b: &mut Batch,
        activity: &Object,
        sender_iri: &str,
    ) -> Result<(), ApiError> {
        let Some(object_iri) = activity.object_iri() else {
            return Ok(());
        };
        let Some(current) = self.objects.find_one(object_iri)? else {
            return Ok(());
        };
        if current.is_tombstone() || current.attributed_to() != Some(sender_iri) {
            return Ok(());
        }
        self.objects.tombstone(b, object_iri, Timestamp::now())?;
        Ok(())
    }

    fn receive_update(
        &self,
        b: &mut Batch,
        activity: &Object,
        sender_iri: &str,
    ) -> Result<(), ApiError> {
        let Some(Value::Object(fields)) = activity.get_value("object") else {
            return Ok(());
        };
        let Some(object_iri) = fields.get("id").and_then(Value::as_str) else {
            return Ok(());
        };
        let Some(current) = self.objects.find_one(object_iri)? else {
            return Ok(());
        };
        if current.is_tombstone() || current.attributed_to() != Some(sender_iri) {
            return Ok(());
        }
        self.objects.patch(b, object_iri, fields, Timestamp::now())?;
        Ok(())
    }

    fn local_actor(&self, iri: &str) -> Result<AsActor, ApiError> {
        let person = self.objects.find_one(iri)?.ok_or(ApiError::NotFound)?;
        Ok(AsActor::from(person))
    }
}

/// Remove `bto`/`bcc` from an activity and from its embedded object.
fn strip_private_addressing_deep(activity: &mut Object) {
    activity.strip_private_addressing();
    if let Some(embedded) = activity.get_value("object").cloned() {
        if let Ok(mut object) = Object::try_from(embedded) {
            object.strip_private_addressing();
            activity.set("object", object.into());
        }
    }
}
