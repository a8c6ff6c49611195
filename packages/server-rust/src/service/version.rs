//! Original-entity reconstruction and optimistic concurrency checks.

use rowsync_core::entity::{get_path, Entity};
use rowsync_core::error::CoreError;
use rowsync_core::messages::RowInfo;
use rowsync_core::metadata::{row_fields, DbSetInfo, Field};
use rowsync_core::row::{ApplyMode, RowSerializer};
use rowsync_core::types::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConcurrencyError {
    #[error("primary key field '{field}' of '{db_set}' cannot be changed")]
    PrimaryKeyChanged { db_set: String, field: String },
    #[error("row '{key}' of '{db_set}' was changed by another user (field '{field}')")]
    Conflict {
        db_set: String,
        key: String,
        field: String,
    },
    #[error("row '{key}' of '{db_set}' no longer exists")]
    Missing { db_set: String, key: String },
}

/// Version helper bound to one collection.
#[derive(Debug, Clone, Copy)]
pub struct EntityVersion<'a> {
    db_set: &'a DbSetInfo,
    serializer: &'a RowSerializer,
}

impl<'a> EntityVersion<'a> {
    #[must_use]
    pub fn new(db_set: &'a DbSetInfo, serializer: &'a RowSerializer) -> Self {
        Self { db_set, serializer }
    }

    /// Rejects a row whose submitted original for a primary key field differs
    /// from the submitted current value.
    ///
    /// # Errors
    ///
    /// Returns [`ConcurrencyError::PrimaryKeyChanged`].
    pub fn check_primary_key(&self, row: &RowInfo) -> Result<(), ConcurrencyError> {
        for field in self.db_set.pk_fields() {
            let Some(vc) = row.find_value(&field.field_name) else {
                continue;
            };
            if vc.orig.is_some() && vc.orig != vc.val {
                return Err(ConcurrencyError::PrimaryKeyChanged {
                    db_set: self.db_set.db_set_name.clone(),
                    field: field.field_name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Builds the pre-change entity: a copy of `current` with the submitted
    /// originals written back over every changed value.
    ///
    /// # Errors
    ///
    /// Fails when an original value cannot be converted.
    pub fn original(&self, current: &dyn Entity, row: &RowInfo) -> Result<Box<dyn Entity>, CoreError> {
        let mut original = current.clone_entity();
        self.serializer
            .apply_values(self.db_set, original.as_mut(), &row.values, ApplyMode::Original)?;
        Ok(original)
    }

    /// Compares every needs-original field of `original` with the `stored`
    /// entity.
    ///
    /// # Errors
    ///
    /// Returns [`ConcurrencyError::Conflict`] naming the first mismatching
    /// field.
    pub fn check_against(
        &self,
        key: &str,
        original: &dyn Entity,
        stored: &dyn Entity,
    ) -> Result<(), ConcurrencyError> {
        match self.versioned_fields().find(|f| {
            let submitted = get_path(original, &f.full_name).unwrap_or(Value::Null);
            let current = get_path(stored, &f.full_name).unwrap_or(Value::Null);
            submitted != current
        }) {
            Some(field) => Err(ConcurrencyError::Conflict {
                db_set: self.db_set.db_set_name.clone(),
                key: key.to_string(),
                field: field.full_name.clone(),
            }),
            None => Ok(()),
        }
    }

    fn versioned_fields(&self) -> impl Iterator<Item = &'a Field> {
        row_fields(&self.db_set.fields).filter(|f| !f.is_object() && f.needs_original())
    }
}
