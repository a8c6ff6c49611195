//! Change-set stage pipeline.
//!
//! Stages are composed once into a [`StagePipeline`] and run in
//! continuation-passing style: each stage receives the mutable
//! [`BatchContext`] and a [`Next`] handle, does its work and calls
//! `next.run(ctx)` to continue. Returning early stops the chain.
//!
//! The standard chain is authorize, apply, validate, commit, track.

pub mod apply;
pub mod authorize;
pub mod commit;
pub mod track;
pub mod validate;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use rowsync_core::entity::Entity;
use rowsync_core::messages::{ChangeSetRequest, ChangeSetResponse, RowInfo, ValidationErrorInfo};
use rowsync_core::types::Principal;
use tracing::{info_span, Instrument};

pub use apply::ApplyStage;
pub use authorize::AuthorizeStage;
pub use commit::CommitStage;
pub use track::TrackStage;
pub use validate::ValidateStage;

use super::data_service::ServiceShared;
use super::error::ServiceError;
use super::graph::{ChangeSetGraph, ParentChildNode, RowRef};
use super::handler::{DataSession, HandlerCache};

// ---------------------------------------------------------------------------
// Per-row working state
// ---------------------------------------------------------------------------

/// Working state of one row during a batch.
#[derive(Debug, Default)]
pub struct EntityChangeState {
    /// Materialized native entity.
    pub entity: Option<Box<dyn Entity>>,
    /// Reconstructed pre-change entity (updates and deletes).
    pub original: Option<Arc<dyn Entity>>,
    /// Failure captured while applying the row.
    pub error: Option<String>,
    pub validation_errors: Vec<ValidationErrorInfo>,
    pub parents: Vec<ParentChildNode>,
}

// ---------------------------------------------------------------------------
// BatchContext
// ---------------------------------------------------------------------------

/// Mutable context shared by every stage of one batch.
pub struct BatchContext {
    pub request: Arc<ChangeSetRequest>,
    pub response: ChangeSetResponse,
    /// Values stages hand to later stages (the dependency graph, for one).
    pub properties: http::Extensions,
    pub states: HashMap<RowRef, EntityChangeState>,
    /// Row whose processing failed, kept for diagnostics.
    pub failed_row: Option<RowRef>,
    pub principal: Arc<Principal>,
    pub shared: Arc<ServiceShared>,
    pub session: Arc<dyn DataSession>,
    pub handlers: HandlerCache,
}

impl std::fmt::Debug for BatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchContext")
            .field("rows", &self.states.len())
            .field("failed_row", &self.failed_row)
            .field("principal", &self.principal.display_name())
            .finish_non_exhaustive()
    }
}

impl BatchContext {
    #[must_use]
    pub fn new(
        request: Arc<ChangeSetRequest>,
        principal: Arc<Principal>,
        shared: Arc<ServiceShared>,
        session: Arc<dyn DataSession>,
        handlers: HandlerCache,
    ) -> Self {
        Self {
            request,
            response: ChangeSetResponse::default(),
            properties: http::Extensions::new(),
            states: HashMap::new(),
            failed_row: None,
            principal,
            shared,
            session,
            handlers,
        }
    }

    /// The dependency graph stored by the apply stage.
    ///
    /// # Errors
    ///
    /// Fails when no earlier stage built the graph.
    pub fn graph(&self) -> Result<Arc<ChangeSetGraph>, ServiceError> {
        self.properties
            .get::<Arc<ChangeSetGraph>>()
            .cloned()
            .ok_or_else(|| ServiceError::Unexpected(anyhow::anyhow!("dependency graph has not been built")))
    }

    #[must_use]
    pub fn row(&self, r: RowRef) -> &RowInfo {
        &self.request.db_sets[r.set_idx].rows[r.row_idx]
    }

    /// Records `r` as the failing row and passes `error` through.
    pub fn fail_row(&mut self, r: RowRef, error: ServiceError) -> ServiceError {
        self.failed_row = Some(r);
        self.states.entry(r).or_default().error = Some(error.to_string());
        error
    }

    /// Names of child fields filled from parent rows of `r`.
    #[must_use]
    pub fn linked_fields(&self, r: RowRef) -> HashSet<String> {
        self.states
            .get(&r)
            .map(|s| {
                s.parents
                    .iter()
                    .flat_map(|p| p.association.field_rels.iter().map(|rel| rel.child_field.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Stage + Next
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Stages that must run before this one.
    fn requires(&self) -> &'static [&'static str] {
        &[]
    }

    async fn handle(&self, ctx: &mut BatchContext, next: Next<'_>) -> Result<(), ServiceError>;
}

/// Remainder of the chain after the running stage.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
}

impl Next<'_> {
    /// Runs the next stage inside a `stage` span, or finishes the chain.
    ///
    /// # Errors
    ///
    /// Propagates the first stage error.
    pub async fn run(self, ctx: &mut BatchContext) -> Result<(), ServiceError> {
        let Some((stage, rest)) = self.stages.split_first() else {
            return Ok(());
        };
        let span = info_span!("stage", name = stage.name());
        stage.handle(ctx, Next { stages: rest }).instrument(span).await
    }
}

// ---------------------------------------------------------------------------
// StagePipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineBuildError {
    #[error("stage pipeline has no stages")]
    Empty,
    #[error("stage '{0}' appears more than once")]
    DuplicateStage(&'static str),
    #[error("stage '{stage}' requires '{required}' to run before it")]
    MissingPrerequisite {
        stage: &'static str,
        required: &'static str,
    },
}

/// Validated, ordered stage chain.
#[derive(Clone)]
pub struct StagePipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl std::fmt::Debug for StagePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|s| s.name()))
            .finish()
    }
}

impl StagePipeline {
    #[must_use]
    pub fn builder() -> StagePipelineBuilder {
        StagePipelineBuilder::default()
    }

    /// Authorize, apply, validate, commit, track.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            stages: vec![
                Arc::new(AuthorizeStage),
                Arc::new(ApplyStage),
                Arc::new(ValidateStage),
                Arc::new(CommitStage),
                Arc::new(TrackStage),
            ],
        }
    }

    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs the chain over `ctx`.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing stage.
    pub async fn execute(&self, ctx: &mut BatchContext) -> Result<(), ServiceError> {
        Next {
            stages: &self.stages,
        }
        .run(ctx)
        .await
    }
}

impl Default for StagePipeline {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Default)]
pub struct StagePipelineBuilder {
    stages: Vec<Arc<dyn Stage>>,
}

impl StagePipelineBuilder {
    #[must_use]
    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Checks the chain once: non-empty, unique names, prerequisites first.
    ///
    /// # Errors
    ///
    /// Returns the first [`PipelineBuildError`] found.
    pub fn build(self) -> Result<StagePipeline, PipelineBuildError> {
        if self.stages.is_empty() {
            return Err(PipelineBuildError::Empty);
        }
        let mut seen: HashSet<&'static str> = HashSet::new();
        for stage in &self.stages {
            for &required in stage.requires() {
                if !seen.contains(required) {
                    return Err(PipelineBuildError::MissingPrerequisite {
                        stage: stage.name(),
                        required,
                    });
                }
            }
            if !seen.insert(stage.name()) {
                return Err(PipelineBuildError::DuplicateStage(stage.name()));
            }
        }
        Ok(StagePipeline {
            stages: self.stages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, &'static [&'static str]);

    #[async_trait]
    impl Stage for Named {
        fn name(&self) -> &'static str {
            self.0
        }
        fn requires(&self) -> &'static [&'static str] {
            self.1
        }
        async fn handle(&self, ctx: &mut BatchContext, next: Next<'_>) -> Result<(), ServiceError> {
            next.run(ctx).await
        }
    }

    #[test]
    fn standard_chain_order() {
        assert_eq!(
            StagePipeline::standard().stage_names(),
            vec!["authorize", "apply", "validate", "commit", "track"]
        );
    }

    #[test]
    fn builder_rejects_bad_chains() {
        assert_eq!(StagePipeline::builder().build().unwrap_err(), PipelineBuildError::Empty);
        assert_eq!(
            StagePipeline::builder()
                .stage(Named("a", &[]))
                .stage(Named("a", &[]))
                .build()
                .unwrap_err(),
            PipelineBuildError::DuplicateStage("a")
        );
        assert_eq!(
            StagePipeline::builder()
                .stage(Named("commit", &["apply"]))
                .stage(Named("apply", &[]))
                .build()
                .unwrap_err(),
            PipelineBuildError::MissingPrerequisite {
                stage: "commit",
                required: "apply"
            }
        );
        assert!(StagePipeline::builder()
            .stage(ApplyStage)
            .stage(CommitStage)
            .build()
            .is_ok());
    }
}
