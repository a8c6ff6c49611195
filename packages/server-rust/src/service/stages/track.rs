//! Terminal stage: hands every committed row of a tracked collection to the
//! change tracker. Changes are already persisted, so tracker failures are
//! logged and never fail the batch.

use async_trait::async_trait;
use rowsync_core::messages::{ValueChange, ValueFlags};
use tracing::warn;

use super::{BatchContext, Next, Stage};
use crate::service::error::ServiceError;
use crate::service::handler::TrackedChange;

#[derive(Debug, Clone, Copy, Default)]
pub struct TrackStage;

#[async_trait]
impl Stage for TrackStage {
    fn name(&self) -> &'static str {
        "track"
    }

    fn requires(&self) -> &'static [&'static str] {
        &["commit"]
    }

    async fn handle(&self, ctx: &mut BatchContext, next: Next<'_>) -> Result<(), ServiceError> {
        let graph = ctx.graph()?;
        for &r in graph.all_list() {
            let db_set = graph.db_set(r.set_idx);
            if !db_set.is_track_changes {
                continue;
            }
            let Some(row) = ctx
                .response
                .db_sets
                .get(r.set_idx)
                .and_then(|s| s.rows.get(r.row_idx))
            else {
                continue;
            };
            let mut diff = Vec::new();
            collect_diff(&row.values, &mut diff);
            let change = TrackedChange {
                principal: &ctx.principal,
                db_set,
                row,
                diff,
            };
            if let Err(e) = ctx.shared.tracker.track(change).await {
                warn!(db_set = %db_set.db_set_name, key = %row.client_key, error = %e, "change tracking failed");
            }
        }
        next.run(ctx).await
    }
}

fn collect_diff<'a>(values: &'a [ValueChange], out: &mut Vec<&'a ValueChange>) {
    for v in values {
        if v.nested.is_empty() {
            if v.is_changed() || v.flags.contains(ValueFlags::REFRESHED) {
                out.push(v);
            }
        } else {
            collect_diff(&v.nested, out);
        }
    }
}
