//! Ownership repair after merging remote operations
//!
//! Concurrent moves on different replicas can leave one entity in two owned
//! slots, or make an ownership cycle. Repair looks only at the merged
//! substrate, so every replica that has seen the same operations makes the
//! same decisions:
//!
//! - among several claims on one entity, the claim written with the highest
//!   stamp keeps it and the others are removed
//! - in a cycle, the edge written with the highest stamp is removed
//!
//! The removals are ordinary local operations and replicate like any other
//! edit. The ownership index is then rebuilt from the surviving claims, and
//! entities left without a claim are orphaned.

use std::collections::{BTreeMap, HashMap, HashSet};

use super::document::{DocState, Document};
use super::layout;
use super::ownership::OwnerSlot;
use super::reference::{EntityId, RefTuple};
use super::schema::{CollectionShape, FieldKind, SchemaRegistry};
use crate::convergent::{ContainerId, ElemId, Stamp, Value};
use crate::error::Result;

/// What a repair pass changed
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RepairReport {
    /// Losing claims on entities that had more than one owner
    pub duplicates_removed: Vec<(EntityId, OwnerSlot)>,
    /// Edges removed to break ownership cycles
    pub cycles_broken: Vec<(EntityId, OwnerSlot)>,
    /// Entities whose back-pointer was cleared because no slot holds them
    pub orphaned: Vec<EntityId>,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.duplicates_removed.is_empty() && self.cycles_broken.is_empty() && self.orphaned.is_empty()
    }
}

/// Where a claim lives in the substrate
#[derive(Clone, Debug)]
enum Locator {
    Root(String),
    Single { owner: EntityId, field: String },
    Element { container: ContainerId, elem: ElemId },
    Entry { container: ContainerId, key: String },
}

/// An owned slot holding an entity
#[derive(Clone, Debug)]
struct Claim {
    child: EntityId,
    slot: OwnerSlot,
    stamp: Stamp,
    locator: Locator,
}

fn local_ref(value: &Value) -> Option<EntityId> {
    RefTuple::from_value(value)
        .filter(RefTuple::is_local)
        .map(|r| r.id)
}

fn collect_claims(s: &DocState, registry: &SchemaRegistry) -> Vec<Claim> {
    let mut claims = Vec::new();

    for (name, value, stamp) in s.replica.map_entries_stamped(&layout::roots()) {
        if let Some(child) = local_ref(&value) {
            claims.push(Claim {
                child,
                slot: OwnerSlot::root(name.as_str()),
                stamp,
                locator: Locator::Root(name),
            });
        }
    }

    for (id, type_name) in s.replica.map_entries(&layout::entities()) {
        let owner = EntityId::from(id);
        let Some(schema) = type_name.as_str().and_then(|t| registry.get(t).ok()) else {
            log::warn!("Skipping {} of unknown type {:?} during repair", owner, type_name);
            continue;
        };
        for spec in schema.owned_fields() {
            let field = spec.name.clone();
            match &spec.kind {
                FieldKind::Reference { .. } => {
                    let fields = layout::fields(&owner);
                    let held = s.replica.map_get(&fields, &field).and_then(local_ref);
                    let stamp = s.replica.map_entry_stamp(&fields, &field).cloned();
                    if let (Some(child), Some(stamp)) = (held, stamp) {
                        claims.push(Claim {
                            child,
                            slot: OwnerSlot::field(&owner, field.as_str()),
                            stamp,
                            locator: Locator::Single {
                                owner: owner.clone(),
                                field,
                            },
                        });
                    }
                }
                FieldKind::Collection { shape, .. } => {
                    let container = layout::collection(&owner, &field);
                    match shape {
                        CollectionShape::List => {
                            for (i, (elem, value)) in s.replica.array_entries(&container).into_iter().enumerate() {
                                if let Some(child) = local_ref(&value) {
                                    claims.push(Claim {
                                        child,
                                        slot: OwnerSlot::indexed(&owner, field.as_str(), i),
                                        stamp: elem.clone(),
                                        locator: Locator::Element {
                                            container: container.clone(),
                                            elem,
                                        },
                                    });
                                }
                            }
                        }
                        CollectionShape::Map | CollectionShape::Set => {
                            for (key, value, stamp) in s.replica.map_entries_stamped(&container) {
                                if let Some(child) = local_ref(&value) {
                                    let slot = match shape {
                                        CollectionShape::Map => OwnerSlot::keyed(&owner, field.as_str(), key.as_str()),
                                        _ => OwnerSlot::field(&owner, field.as_str()),
                                    };
                                    claims.push(Claim {
                                        child,
                                        slot,
                                        stamp,
                                        locator: Locator::Entry {
                                            container: container.clone(),
                                            key,
                                        },
                                    });
                                }
                            }
                        }
                    }
                }
                FieldKind::Scalar { .. } => {}
            }
        }
    }
    claims
}

fn remove_claim(doc: &Document, claim: &Claim) -> Result<()> {
    doc.with_state(|s| -> Result<()> {
        match &claim.locator {
            Locator::Root(name) => {
                s.replica.map_remove(&layout::roots(), name)?;
            }
            Locator::Single { owner, field } => {
                s.replica.map_put(&layout::fields(owner), field, Value::Null)?;
            }
            Locator::Element { container, elem } => {
                s.replica.array_remove_elem(container, elem)?;
            }
            Locator::Entry { container, key } => {
                s.replica.map_remove(container, key)?;
            }
        }
        Ok(())
    })?;
    doc.record_change(claim.slot.change_key());
    Ok(())
}

/// Claims along an ownership cycle, if there is one
fn find_cycle(claims: &[Claim]) -> Option<Vec<&Claim>> {
    let parent: BTreeMap<&EntityId, &Claim> = claims
        .iter()
        .filter(|c| c.slot.owner_entity().is_some())
        .map(|c| (&c.child, c))
        .collect();

    let mut done: HashSet<&EntityId> = HashSet::new();
    for start in parent.keys() {
        let mut path: Vec<&EntityId> = Vec::new();
        let mut on_path: HashMap<&EntityId, usize> = HashMap::new();
        let mut current: &EntityId = start;
        loop {
            if done.contains(current) {
                break;
            }
            if let Some(&pos) = on_path.get(current) {
                return Some(path[pos..].iter().map(|id| parent[id]).collect());
            }
            on_path.insert(current, path.len());
            path.push(current);
            match parent.get(current).and_then(|c| c.slot.owner_entity()) {
                Some(next) => current = next,
                None => break,
            }
        }
        done.extend(path);
    }
    None
}

/// Recompute every back-pointer from the owned slots in the substrate.
/// Returns the entities that lost their owner.
pub(crate) fn rebuild_index(doc: &Document) -> Result<Vec<EntityId>> {
    let registry = doc.registry().clone();
    let claims = doc.read(|s| collect_claims(s, &registry));
    let desired: HashMap<EntityId, OwnerSlot> = claims.into_iter().map(|c| (c.child, c.slot)).collect();
    let mut orphaned = Vec::new();
    doc.with_state(|s| {
        let stale: Vec<EntityId> = s
            .ownership
            .entries()
            .filter(|(id, slot)| desired.get(*id) != Some(*slot))
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            s.ownership.set(id.clone(), None);
            if !desired.contains_key(&id) {
                orphaned.push(id);
            }
        }
        for (id, slot) in &desired {
            if s.ownership.slot(id) != Some(slot) {
                s.ownership.set(id.clone(), Some(slot.clone()));
            }
        }
    });
    Ok(orphaned)
}

/// Run the repair pass. The caller holds a transaction on `doc`.
pub(crate) fn reconcile(doc: &Document) -> Result<RepairReport> {
    let registry = doc.registry().clone();
    let mut report = RepairReport::default();

    let mut by_child: BTreeMap<EntityId, Vec<Claim>> = BTreeMap::new();
    for claim in doc.read(|s| collect_claims(s, &registry)) {
        by_child.entry(claim.child.clone()).or_default().push(claim);
    }
    for (child, mut claims) in by_child {
        if claims.len() < 2 {
            continue;
        }
        claims.sort_by(|a, b| b.stamp.cmp(&a.stamp));
        for loser in &claims[1..] {
            log::warn!(
                "{} claimed by both {} and {}; keeping {}",
                child,
                claims[0].slot,
                loser.slot,
                claims[0].slot
            );
            remove_claim(doc, loser)?;
            report.duplicates_removed.push((child.clone(), loser.slot.clone()));
        }
    }

    loop {
        let claims = doc.read(|s| collect_claims(s, &registry));
        let Some(victim) = find_cycle(&claims)
            .and_then(|cycle| cycle.into_iter().max_by(|a, b| a.stamp.cmp(&b.stamp)).cloned())
        else {
            break;
        };
        log::warn!("Breaking ownership cycle at {} in {}", victim.child, victim.slot);
        remove_claim(doc, &victim)?;
        report.cycles_broken.push((victim.child, victim.slot));
    }

    report.orphaned = rebuild_index(doc)?;

    for id in &report.orphaned {
        log::debug!("Orphaned {} after merge", id);
    }
    if !report.is_clean() {
        log::info!(
            "Repair on {}: {} duplicate claims, {} cycles, {} orphans",
            doc.id(),
            report.duplicates_removed.len(),
            report.cycles_broken.len(),
            report.orphaned.len()
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphConfig;
    use crate::graph::entity::{Entity, Fields};
    use crate::graph::schema::{ScalarKind, TypeSchema};
    use std::sync::Arc;

    fn registry() -> Arc<SchemaRegistry> {
        let registry = SchemaRegistry::new();
        registry
            .define_type(
                TypeSchema::new("Folder")
                    .scalar("name", ScalarKind::String)
                    .owned_list("children", "Folder"),
            )
            .unwrap();
        registry
    }

    fn folder(registry: &Arc<SchemaRegistry>, name: &str) -> Entity {
        Entity::create(registry, "Folder", Fields::new().scalar("name", name)).unwrap()
    }

    #[test]
    fn test_consistent_document_is_clean() {
        let registry = registry();
        let doc = Document::new(registry.clone(), GraphConfig::default()).unwrap();
        let top = folder(&registry, "top");
        top.list("children").unwrap().push(&folder(&registry, "a")).unwrap();
        doc.set_root("top", &top).unwrap();

        let report = doc.reconcile().unwrap();
        assert!(report.is_clean(), "{:?}", report);
    }

    #[test]
    fn test_duplicate_claim_keeps_latest() {
        let registry = registry();
        let doc = Document::new(registry.clone(), GraphConfig::default()).unwrap();
        let (a, b, x) = (folder(&registry, "a"), folder(&registry, "b"), folder(&registry, "x"));
        doc.set_root("a", &a).unwrap();
        doc.set_root("b", &b).unwrap();
        a.list("children").unwrap().push(&x).unwrap();

        // Write a second claim behind the ownership protocol's back
        let reference = RefTuple::local(x.id().clone()).to_value();
        doc.transact(|| {
            doc.with_state(|s| s.replica.array_push(&layout::collection(b.id(), "children"), reference))?;
            Ok(())
        })
        .unwrap();

        let report = doc.reconcile().unwrap();
        assert_eq!(report.duplicates_removed, vec![(x.id().clone(), OwnerSlot::indexed(a.id(), "children", 0))]);
        assert_eq!(a.list("children").unwrap().len(), 0);
        assert_eq!(b.list("children").unwrap().to_vec().unwrap(), vec![x.clone()]);
        assert_eq!(x.owner(), Some(OwnerSlot::indexed(b.id(), "children", 0)));
    }

    #[test]
    fn test_cycle_is_broken() {
        let registry = registry();
        let doc = Document::new(registry.clone(), GraphConfig::default()).unwrap();
        let (a, b) = (folder(&registry, "a"), folder(&registry, "b"));
        doc.set_root("a", &a).unwrap();
        a.list("children").unwrap().push(&b).unwrap();

        // b.children = [a] closes a cycle a -> b -> a
        let reference = RefTuple::local(a.id().clone()).to_value();
        doc.transact(|| {
            doc.with_state(|s| s.replica.map_remove(&layout::roots(), "a"))?;
            doc.with_state(|s| s.replica.array_push(&layout::collection(b.id(), "children"), reference))?;
            Ok(())
        })
        .unwrap();

        let report = doc.reconcile().unwrap();
        assert_eq!(report.cycles_broken.len(), 1);
        // The newest edge (b owns a) is the one removed
        assert_eq!(report.cycles_broken[0].0, *a.id());
        assert_eq!(b.owner(), Some(OwnerSlot::indexed(a.id(), "children", 0)));
        assert_eq!(a.owner(), None);
        assert!(report.orphaned.contains(a.id()));
    }
}
