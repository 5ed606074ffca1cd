use tracing::warn;

use super::ids::IdMaps;
use super::model::{DealEmbeddedPayload, EmbeddedId, EntityType, RelationRef, SourceDeal};

/// Relation the embedder could not resolve through the id map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedRelation {
    pub entity: EntityType,
    pub source_id: String,
}

/// Resolve a deal's linked contacts and companies to destination ids and
/// merge them into `embedded`. Unresolvable links are logged and left out; the
/// deal itself is still created. Categories with nothing resolved stay empty
/// and are therefore not serialized.
pub fn embed_relations(
    deal: &SourceDeal,
    maps: &IdMaps,
    embedded: &mut DealEmbeddedPayload,
) -> Vec<UnresolvedRelation> {
    let mut unresolved = Vec::new();
    embedded.contacts = resolve(
        deal,
        &deal.embedded.contacts,
        EntityType::Contact,
        maps,
        &mut unresolved,
    );
    embedded.companies = resolve(
        deal,
        &deal.embedded.companies,
        EntityType::Company,
        maps,
        &mut unresolved,
    );
    unresolved
}

fn resolve(
    deal: &SourceDeal,
    refs: &[RelationRef],
    entity: EntityType,
    maps: &IdMaps,
    unresolved: &mut Vec<UnresolvedRelation>,
) -> Vec<EmbeddedId> {
    let mut out: Vec<EmbeddedId> = Vec::with_capacity(refs.len());
    for r in refs {
        match maps.get(entity, &r.id) {
            Some(id) => {
                if !out.iter().any(|e| e.id == id) {
                    out.push(EmbeddedId { id });
                }
            }
            None => {
                warn!(
                    deal = %deal.id,
                    relation = entity.api_name(),
                    relation_id = %r.id,
                    "relation not migrated; link skipped"
                );
                unresolved.push(UnresolvedRelation {
                    entity,
                    source_id: r.id.to_string(),
                });
            }
        }
    }
    out
}
