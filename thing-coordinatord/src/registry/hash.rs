use std::net::IpAddr;
use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::{Entity, Relationship, Thing};

/// Hash only announced content; `discovered_at` depends on when the
/// coordinator happened to hear the Thing.
#[derive(Serialize)]
struct ThingView<'a> {
    id: &'a str,
    address: IpAddr,
    name: &'a str,
    space_id: &'a str,
    model: &'a str,
    owner: &'a str,
    vendor: &'a str,
    description: &'a str,
    entities: &'a [Entity],
}

/// Computes a SHA-256 fingerprint of the registry.
/// Things are sorted by id and relationships by their identity so the result
/// does not depend on announcement order.
pub fn compute_hash(things: &[Thing], relationships: &[Relationship]) -> String {
    let mut thing_idx: Vec<usize> = (0..things.len()).collect();
    thing_idx.sort_by(|&a, &b| things[a].id.cmp(&things[b].id));

    let views: Vec<ThingView<'_>> = thing_idx
        .iter()
        .map(|&i| {
            let t = &things[i];
            ThingView {
                id: &t.id,
                address: t.address,
                name: &t.name,
                space_id: &t.space_id,
                model: &t.model,
                owner: &t.owner,
                vendor: &t.vendor,
                description: &t.description,
                entities: &t.entities,
            }
        })
        .collect();

    let mut rels: Vec<&Relationship> = relationships.iter().collect();
    rels.sort_by(|a, b| {
        (&a.thing_id, &a.name, &a.src, &a.dst).cmp(&(&b.thing_id, &b.name, &b.src, &b.dst))
    });

    let json = serde_json::to_string(&(views, rels)).unwrap_or_default();

    let hash = Sha256::digest(json.as_bytes());
    hex::encode(hash)
}
