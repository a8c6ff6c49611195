//! Builds the dependency graph and applies every row through its handler:
//! inserts, then updates, then deletes, each in graph order.

use std::sync::Arc;

use async_trait::async_trait;
use rowsync_core::entity::{get_path, set_path, Entity};
use rowsync_core::messages::{ChangeType, RowInfo, ValueChange};
use rowsync_core::metadata::DbSetInfo;
use rowsync_core::row::ApplyMode;
use rowsync_core::types::Value;
use tracing::{debug, info};

use super::{BatchContext, EntityChangeState, Next, Stage};
use crate::service::context::{scoped, OperationKind, RequestContext};
use crate::service::error::ServiceError;
use crate::service::graph::{batch_collections, ChangeSetGraph, RowRef};
use crate::service::version::EntityVersion;

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyStage;

#[async_trait]
impl Stage for ApplyStage {
    fn name(&self) -> &'static str {
        "apply"
    }

    async fn handle(&self, ctx: &mut BatchContext, next: Next<'_>) -> Result<(), ServiceError> {
        let total: usize = ctx.request.db_sets.iter().map(|s| s.rows.len()).sum();
        let limit = ctx.shared.config.max_rows_per_batch;
        if total > limit {
            return Err(ServiceError::protocol(format!(
                "batch has {total} rows, the limit is {limit}"
            )));
        }

        let graph = Arc::new(ChangeSetGraph::build(&ctx.shared.metadata, &ctx.request)?);
        ctx.properties.insert(Arc::clone(&graph));
        check_rows(ctx, &graph)?;

        info!(
            collections = ?batch_collections(&ctx.request),
            inserts = graph.insert_list().len(),
            updates = graph.update_list().len(),
            deletes = graph.delete_list().len(),
            "applying change set"
        );
        for &r in graph
            .insert_list()
            .iter()
            .chain(graph.update_list())
            .chain(graph.delete_list())
        {
            if let Err(e) = apply_row(ctx, &graph, r).await {
                return Err(ctx.fail_row(r, e));
            }
        }
        next.run(ctx).await
    }
}

/// Shape checks done before any row touches the store.
fn check_rows(ctx: &BatchContext, graph: &ChangeSetGraph) -> Result<(), ServiceError> {
    if let Some(&r) = graph.untyped_rows().first() {
        let db_set = graph.db_set(r.set_idx);
        return Err(ServiceError::protocol(format!(
            "row '{}' of DbSet '{}' (entity type '{}') has no change type",
            ctx.row(r).client_key,
            db_set.db_set_name,
            db_set.entity_type
        )));
    }
    for &r in graph.update_list() {
        if let Some(vc) = first_changed_unset(&ctx.row(r).values) {
            return Err(ServiceError::protocol(format!(
                "value '{}' of row '{}' is marked changed but not set",
                vc.field_name,
                ctx.row(r).client_key
            )));
        }
    }
    Ok(())
}

fn first_changed_unset(values: &[ValueChange]) -> Option<&ValueChange> {
    values.iter().find_map(|v| {
        if v.is_changed() && !v.is_set() && v.nested.is_empty() {
            Some(v)
        } else {
            first_changed_unset(&v.nested)
        }
    })
}

/// Applies one row. The row's state, with whatever part of the entity was
/// materialized, is recorded whether or not the row succeeds.
async fn apply_row(ctx: &mut BatchContext, graph: &ChangeSetGraph, r: RowRef) -> Result<(), ServiceError> {
    let db_set = Arc::clone(graph.db_set(r.set_idx));
    let row: RowInfo = ctx.row(r).clone();
    let handler = ctx.handlers.get(ctx.session.as_ref(), &db_set)?;

    let mut entity = handler.create_entity();
    let mut state = EntityChangeState {
        parents: graph.parents(r).cloned().collect(),
        ..EntityChangeState::default()
    };
    let result = match materialize(ctx, &db_set, &row, entity.as_mut(), &mut state) {
        Ok(frame) => {
            let frame = frame.with_row(row.clone());
            let applied = match row.change_type {
                ChangeType::Added => scoped(frame, handler.insert(entity.as_mut())).await,
                ChangeType::Updated => scoped(frame, handler.update(entity.as_mut())).await,
                _ => scoped(frame, handler.delete(entity.as_mut())).await,
            };
            applied.map_err(ServiceError::collaborator)
        }
        Err(e) => Err(e),
    };
    state.entity = Some(entity);
    ctx.states.insert(r, state);
    result?;
    debug!(db_set = %db_set.db_set_name, key = %row.client_key, change = ?row.change_type, "row applied");
    Ok(())
}

/// Writes the submitted values into `entity` and builds the ambient frame
/// the handler runs under.
fn materialize(
    ctx: &BatchContext,
    db_set: &Arc<DbSetInfo>,
    row: &RowInfo,
    entity: &mut dyn Entity,
    state: &mut EntityChangeState,
) -> Result<RequestContext, ServiceError> {
    let serializer = &ctx.shared.serializer;
    let version = EntityVersion::new(db_set, serializer);
    let mut frame = RequestContext::new(OperationKind::Row, Arc::clone(&ctx.principal))
        .with_db_set(Arc::clone(db_set))
        .with_change_set(Arc::clone(&ctx.request));

    match row.change_type {
        ChangeType::Added => {
            serializer.apply_values(db_set, entity, &row.values, ApplyMode::Insert)?;
            for node in &state.parents {
                let parent = ctx
                    .states
                    .get(&node.parent)
                    .and_then(|s| s.entity.as_deref())
                    .ok_or_else(|| {
                        ServiceError::Unexpected(anyhow::anyhow!(
                            "parent of row '{}' was not applied before it",
                            row.client_key
                        ))
                    })?;
                for rel in &node.association.field_rels {
                    let value = get_path(parent, &rel.parent_field).unwrap_or(Value::Null);
                    set_path(entity, &rel.child_field, value)?;
                }
                frame = frame.with_parent(node.association.name.clone(), Arc::from(parent.clone_entity()));
            }
        }
        ChangeType::Updated => {
            version.check_primary_key(row)?;
            serializer.apply_values(db_set, entity, &row.values, ApplyMode::Update)?;
            let original: Arc<dyn Entity> = Arc::from(version.original(entity, row)?);
            state.original = Some(Arc::clone(&original));
            frame = frame.with_original(original);
        }
        ChangeType::Deleted => {
            version.check_primary_key(row)?;
            serializer.apply_values(db_set, entity, &row.values, ApplyMode::Original)?;
            let original: Arc<dyn Entity> = Arc::from(entity.clone_entity());
            state.original = Some(Arc::clone(&original));
            frame = frame.with_original(original);
        }
        ChangeType::None => {
            return Err(ServiceError::protocol(format!(
                "row '{}' of DbSet '{}' has no change type",
                row.client_key, db_set.db_set_name
            )))
        }
    }
    Ok(frame)
}
