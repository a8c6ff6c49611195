//! Checks every method the batch would call before anything is applied.

use async_trait::async_trait;
use rowsync_core::messages::ChangeType;
use rowsync_core::metadata::{MethodInfoData, MethodType};
use tracing::debug;

use super::{BatchContext, Next, Stage};
use crate::service::authorization::authorize_methods;
use crate::service::error::ServiceError;
use crate::service::graph::GraphError;

#[derive(Debug, Clone, Copy, Default)]
pub struct AuthorizeStage;

/// Method bound for a change type. Rows without a change type have none; the
/// apply stage rejects them.
pub(crate) fn method_type(change_type: ChangeType) -> Option<MethodType> {
    match change_type {
        ChangeType::Added => Some(MethodType::Insert),
        ChangeType::Updated => Some(MethodType::Update),
        ChangeType::Deleted => Some(MethodType::Delete),
        ChangeType::None => None,
    }
}

#[async_trait]
impl Stage for AuthorizeStage {
    fn name(&self) -> &'static str {
        "authorize"
    }

    async fn handle(&self, ctx: &mut BatchContext, next: Next<'_>) -> Result<(), ServiceError> {
        let metadata = &ctx.shared.metadata;
        let mut methods: Vec<&MethodInfoData> = Vec::new();
        for changes in &ctx.request.db_sets {
            let db_set = metadata
                .db_set(&changes.db_set_name)
                .ok_or_else(|| GraphError::UnknownDbSet(changes.db_set_name.clone()))?;
            let mut seen: Vec<MethodType> = Vec::new();
            for ty in changes.rows.iter().filter_map(|r| method_type(r.change_type)) {
                if seen.contains(&ty) {
                    continue;
                }
                seen.push(ty);
                let method = db_set.method_info(ty).ok_or_else(|| {
                    ServiceError::protocol(format!(
                        "DbSet '{}' has no {ty:?} method",
                        db_set.db_set_name
                    ))
                })?;
                methods.push(method);
            }
        }
        debug!(methods = methods.len(), "batch methods collected");
        authorize_methods(metadata, &ctx.principal, methods)?;
        next.run(ctx).await
    }
}
