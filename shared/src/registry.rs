//! The capability model: everything the coordinator has learned from announcements.
//!
//! Merging is append-only and idempotent. Re-applying a fact never creates a
//! duplicate and never alters the record already held.

use std::collections::HashMap;
use std::net::IpAddr;
use chrono::{DateTime, Utc};
use crate::tweet::{EntityTweet, RelationshipTweet, ServiceTweet, ThingTweet, Tweet};
use crate::types::{Entity, Relationship, Service, Signature, SignatureError, Thing};

/// Result of merging one fact into the model.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Added,
    Duplicate,
    UnknownThing(String),
    UnknownEntity { thing_id: String, entity_id: String },
    BadSignature(SignatureError),
    /// Tweet kind the model has no record for
    Ignored(String),
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, MergeOutcome::Added)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CapabilityModel {
    things: Vec<Thing>,
    index: HashMap<String, usize>,
    relationships: Vec<Relationship>,
}

impl CapabilityModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch a decoded announcement to the matching mutator.
    pub fn apply(&mut self, tweet: &Tweet, source: IpAddr, now: DateTime<Utc>) -> MergeOutcome {
        match tweet {
            Tweet::IdentityThing(t) => self.add_thing(t, source, now),
            Tweet::IdentityEntity(e) => self.add_entity(e),
            Tweet::Service(s) => self.add_service(s, source),
            Tweet::Relationship(r) => self.add_relationship(r),
            Tweet::Unrecognized(kind) => MergeOutcome::Ignored(kind.clone()),
        }
    }

    pub fn add_thing(&mut self, tweet: &ThingTweet, address: IpAddr, now: DateTime<Utc>) -> MergeOutcome {
        if self.index.contains_key(&tweet.thing_id) {
            return MergeOutcome::Duplicate;
        }

        self.index.insert(tweet.thing_id.clone(), self.things.len());
        self.things.push(Thing {
            id: tweet.thing_id.clone(),
            address,
            name: tweet.name.clone(),
            space_id: tweet.space_id.clone(),
            model: tweet.model.clone(),
            owner: tweet.owner.clone(),
            vendor: tweet.vendor.clone(),
            description: tweet.description.clone(),
            discovered_at: now,
            entities: Vec::new(),
        });
        MergeOutcome::Added
    }

    pub fn add_entity(&mut self, tweet: &EntityTweet) -> MergeOutcome {
        let Some(thing) = self.thing_mut(&tweet.thing_id) else {
            tracing::debug!("Entity {} announced for unknown thing {}", tweet.entity_id, tweet.thing_id);
            return MergeOutcome::UnknownThing(tweet.thing_id.clone());
        };

        if thing.entity(&tweet.entity_id).is_some() {
            return MergeOutcome::Duplicate;
        }

        let entity = Entity {
            id: tweet.entity_id.clone(),
            name: tweet.name.clone(),
            thing_id: thing.id.clone(),
            thing_name: thing.name.clone(),
            space_id: tweet.space_id.clone(),
            kind: tweet.kind.clone(),
            owner: tweet.owner.clone(),
            vendor: tweet.vendor.clone(),
            description: tweet.description.clone(),
            services: Vec::new(),
        };
        thing.entities.push(entity);
        MergeOutcome::Added
    }

    /// Parse the announced signature and attach the Service to its Entity.
    ///
    /// Never fails: a bad signature or an unknown Thing/Entity is logged and
    /// reported through the outcome, leaving the model untouched.
    pub fn add_service(&mut self, tweet: &ServiceTweet, source: IpAddr) -> MergeOutcome {
        let signature: Signature = match tweet.api.parse() {
            Ok(sig) => sig,
            Err(e) => {
                tracing::warn!("Dropping service {} of {}: {}", tweet.name, tweet.thing_id, e);
                return MergeOutcome::BadSignature(e);
            }
        };

        let Some(thing) = self.thing_mut(&tweet.thing_id) else {
            tracing::warn!("Service {} announced for unknown thing {}", tweet.name, tweet.thing_id);
            return MergeOutcome::UnknownThing(tweet.thing_id.clone());
        };
        let thing_id = thing.id.clone();
        let thing_name = thing.name.clone();

        let Some(entity) = thing.entity_mut(&tweet.entity_id) else {
            tracing::warn!(
                "Service {} announced for unknown entity {}/{}",
                tweet.name,
                tweet.thing_id,
                tweet.entity_id
            );
            return MergeOutcome::UnknownEntity {
                thing_id,
                entity_id: tweet.entity_id.clone(),
            };
        };

        let exists = entity.services.iter().any(|s| {
            s.name == tweet.name && s.entity_id == tweet.entity_id && s.signature.endpoint == signature.endpoint
        });
        if exists {
            return MergeOutcome::Duplicate;
        }

        entity.services.push(Service {
            name: tweet.name.clone(),
            thing_id,
            thing_name,
            entity_id: tweet.entity_id.clone(),
            space_id: tweet.space_id.clone(),
            signature,
            kind: tweet.kind.clone(),
            app_category: tweet.app_category.clone(),
            description: tweet.description.clone(),
            keywords: tweet.keywords.clone(),
            address: Some(source),
        });
        MergeOutcome::Added
    }

    pub fn add_relationship(&mut self, tweet: &RelationshipTweet) -> MergeOutcome {
        let exists = self.relationships.iter().any(|r| {
            r.thing_id == tweet.thing_id
                && r.name == tweet.name
                && r.src == tweet.first_service
                && r.dst == tweet.second_service
        });
        if exists {
            return MergeOutcome::Duplicate;
        }

        self.relationships.push(Relationship {
            name: tweet.name.clone(),
            category: tweet.category.clone(),
            kind: tweet.kind.clone(),
            description: tweet.description.clone(),
            thing_id: tweet.thing_id.clone(),
            space_id: tweet.space_id.clone(),
            owner: tweet.owner.clone(),
            src: tweet.first_service.clone(),
            dst: tweet.second_service.clone(),
        });
        MergeOutcome::Added
    }

    pub fn thing(&self, thing_id: &str) -> Option<&Thing> {
        self.index.get(thing_id).map(|&i| &self.things[i])
    }

    fn thing_mut(&mut self, thing_id: &str) -> Option<&mut Thing> {
        let i = *self.index.get(thing_id)?;
        self.things.get_mut(i)
    }

    /// Things in discovery order
    pub fn things(&self) -> &[Thing] {
        &self.things
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.things.iter().flat_map(|t| t.entities.iter())
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.entities().flat_map(|e| e.services.iter())
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }
}
