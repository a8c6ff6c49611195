//! Commits the session, runs the service hooks and refreshes every row of
//! the response from its persisted entity.

use async_trait::async_trait;
use rowsync_core::messages::ChangeType;
use tracing::{debug, info};

use super::{BatchContext, Next, Stage};
use crate::service::error::ServiceError;

#[derive(Debug, Clone, Copy, Default)]
pub struct CommitStage;

#[async_trait]
impl Stage for CommitStage {
    fn name(&self) -> &'static str {
        "commit"
    }

    fn requires(&self) -> &'static [&'static str] {
        &["apply"]
    }

    async fn handle(&self, ctx: &mut BatchContext, next: Next<'_>) -> Result<(), ServiceError> {
        let graph = ctx.graph()?;
        let session = ctx.session.as_ref();
        let hooks = &ctx.shared.hooks;

        let mut subsets = session.commit().await.map_err(ServiceError::collaborator)?;
        hooks
            .after_execute_changes(session)
            .await
            .map_err(ServiceError::collaborator)?;
        subsets.extend(
            hooks
                .after_commit_changes(session)
                .await
                .map_err(ServiceError::collaborator)?,
        );

        let mut db_sets = ctx.request.db_sets.clone();
        let serializer = &ctx.shared.serializer;
        let mut refreshed = 0;
        for &r in graph.all_list() {
            let db_set = graph.db_set(r.set_idx);
            let Some(entity) = ctx.states.get(&r).and_then(|s| s.entity.as_deref()) else {
                continue;
            };
            let row = &mut db_sets[r.set_idx].rows[r.row_idx];
            if row.change_type != ChangeType::Deleted {
                refreshed += serializer.refresh_values(db_set, entity, &mut row.values)?;
            }
            row.server_key = Some(serializer.row_key(db_set, entity)?);
        }
        debug!(refreshed, "rows refreshed from persisted state");

        ctx.response.subsets = ctx.shared.serialize_subsets(subsets)?;
        ctx.response.db_sets = db_sets;
        info!(rows = graph.all_list().len(), "change set committed");
        next.run(ctx).await
    }
}
