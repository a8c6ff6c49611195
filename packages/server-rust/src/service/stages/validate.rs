//! Validates every inserted and updated row. All invalid rows are collected
//! before the batch is rejected.

use std::sync::Arc;

use async_trait::async_trait;
use rowsync_core::messages::{ChangeType, InvalidRow, ValueChange};
use tracing::warn;

use super::{BatchContext, Next, Stage};
use crate::service::context::{scoped, OperationKind, RequestContext};
use crate::service::error::ServiceError;

#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateStage;

#[async_trait]
impl Stage for ValidateStage {
    fn name(&self) -> &'static str {
        "validate"
    }

    fn requires(&self) -> &'static [&'static str] {
        &["apply"]
    }

    async fn handle(&self, ctx: &mut BatchContext, next: Next<'_>) -> Result<(), ServiceError> {
        let graph = ctx.graph()?;
        let mut invalid = Vec::new();

        for &r in graph.insert_list().iter().chain(graph.update_list()) {
            let db_set = Arc::clone(graph.db_set(r.set_idx));
            let row = ctx.row(r).clone();
            let linked = if row.change_type == ChangeType::Added {
                ctx.linked_fields(r)
            } else {
                Default::default()
            };
            let handler = ctx.handlers.get(ctx.session.as_ref(), &db_set)?;
            let model_validator = ctx.shared.model_validators.get(&db_set.db_set_name).cloned();

            let Some(state) = ctx.states.get(&r) else {
                continue;
            };
            let Some(entity) = state.entity.as_deref() else {
                continue;
            };
            let mut errors = ctx
                .shared
                .field_validator
                .validate_row(&db_set, entity, &row, &linked)?;

            let mut frame = RequestContext::new(OperationKind::Row, Arc::clone(&ctx.principal))
                .with_db_set(Arc::clone(&db_set))
                .with_change_set(Arc::clone(&ctx.request))
                .with_row(row.clone());
            if let Some(original) = &state.original {
                frame = frame.with_original(Arc::clone(original));
            }
            let modified = modified_fields(&row.values, "");
            let (handler_errors, model_errors) = scoped(frame, async {
                let handler_errors = handler.validate(entity).await?;
                let model_errors = match &model_validator {
                    Some(v) => v.validate(entity, &modified).await?,
                    None => Vec::new(),
                };
                anyhow::Ok((handler_errors, model_errors))
            })
            .await
            .map_err(ServiceError::collaborator)?;
            errors.extend(handler_errors);
            errors.extend(model_errors);

            if !errors.is_empty() {
                invalid.push(InvalidRow {
                    db_set_name: db_set.db_set_name.clone(),
                    client_key: row.client_key.clone(),
                    errors: errors.clone(),
                });
                if let Some(state) = ctx.states.get_mut(&r) {
                    state.validation_errors = errors;
                }
            }
        }

        if !invalid.is_empty() {
            warn!(rows = invalid.len(), "change set failed validation");
            return Err(ServiceError::Validation(invalid));
        }
        next.run(ctx).await
    }
}

/// Full names of every value the client changed.
fn modified_fields(values: &[ValueChange], prefix: &str) -> Vec<String> {
    let mut names = Vec::new();
    for v in values {
        let full = if prefix.is_empty() {
            v.field_name.clone()
        } else {
            format!("{prefix}.{}", v.field_name)
        };
        if v.nested.is_empty() {
            if v.is_changed() {
                names.push(full);
            }
        } else {
            names.extend(modified_fields(&v.nested, &full));
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use rowsync_core::messages::ValueChange;

    use super::*;

    #[test]
    fn modified_fields_use_full_paths() {
        let values = vec![
            ValueChange::changed("Name", Some("Ann")),
            ValueChange::new("Age", Some("3")),
            ValueChange::object("Address", vec![ValueChange::changed("City", Some("Oslo"))]),
        ];
        assert_eq!(modified_fields(&values, ""), vec!["Name", "Address.City"]);
    }
}
