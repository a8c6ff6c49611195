//! Row serialization: native entities to flat wire rows and back.
//!
//! A row holds one converted value per row field, in declared field order.
//! Object-typed fields recurse into their nested fields positionally, so the
//! order of the metadata is the contract, not the names.

use std::collections::HashSet;
use std::sync::Arc;

use crate::convert::ValueConverter;
use crate::entity::{get_path, set_path, Entity};
use crate::error::CoreError;
use crate::messages::{FieldName, Row, ValueChange, ValueFlags, WireValue};
use crate::metadata::{row_fields, DbSetInfo, Field, FieldKind};
use crate::types::Value;

/// Separator between primary key components of a composite key.
pub const KEY_SEPARATOR: &str = ";";

/// How submitted [`ValueChange`]s are copied onto an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// New entity: read-only and generated fields are skipped unless the
    /// field allows client defaults and the client set it.
    Insert,
    /// Current state of an existing entity. Changing a read-only field is an
    /// error.
    Update,
    /// Pre-change state: the submitted original for changed values, the
    /// current value otherwise.
    Original,
}

/// Converts entities to rows and applies submitted values onto entities.
#[derive(Clone)]
pub struct RowSerializer {
    converter: Arc<dyn ValueConverter>,
}

impl std::fmt::Debug for RowSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowSerializer").finish_non_exhaustive()
    }
}

impl RowSerializer {
    #[must_use]
    pub fn new(converter: Arc<dyn ValueConverter>) -> Self {
        Self { converter }
    }

    #[must_use]
    pub fn converter(&self) -> &dyn ValueConverter {
        self.converter.as_ref()
    }

    /// Converts one field value of `entity`.
    ///
    /// # Errors
    ///
    /// Returns a [`CoreError::Conversion`] when the converter rejects a value.
    pub fn field_value(&self, field: &Field, entity: &dyn Entity) -> Result<WireValue, CoreError> {
        let value = get_path(entity, &field.full_name).unwrap_or(Value::Null);
        self.wire_value(field, &value)
    }

    fn wire_value(&self, field: &Field, value: &Value) -> Result<WireValue, CoreError> {
        if field.is_object() {
            let nested = match value {
                Value::Object(map) => row_fields(&field.nested)
                    .map(|f| self.wire_value(f, map.get(&f.field_name).unwrap_or(&Value::Null)))
                    .collect::<Result<Vec<_>, _>>()?,
                Value::Null => return Ok(WireValue::Null),
                _ => return Err(CoreError::conversion(&field.full_name, "expected an object value")),
            };
            return Ok(WireValue::Nested(nested));
        }
        Ok(self.converter.serialize(field, value)?.into())
    }

    /// Composite key: primary key values converted and joined with `;` in
    /// key order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NullPrimaryKey`] when any key value is null.
    pub fn row_key(&self, db_set: &DbSetInfo, entity: &dyn Entity) -> Result<String, CoreError> {
        let mut parts = Vec::with_capacity(db_set.primary_keys.len());
        for field in db_set.pk_fields() {
            let value = entity.get_value(&field.field_name).unwrap_or(Value::Null);
            match self.converter.serialize(field, &value)? {
                Some(text) => parts.push(text),
                None => {
                    return Err(CoreError::NullPrimaryKey {
                        db_set: db_set.db_set_name.clone(),
                        field: field.field_name.clone(),
                    })
                }
            }
        }
        Ok(parts.join(KEY_SEPARATOR))
    }

    /// Serializes one entity.
    ///
    /// # Errors
    ///
    /// Fails on null primary keys and conversion errors.
    pub fn to_row(&self, db_set: &DbSetInfo, entity: &dyn Entity) -> Result<Row, CoreError> {
        let k = self.row_key(db_set, entity)?;
        let v = row_fields(&db_set.fields)
            .map(|f| self.field_value(f, entity))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Row { k, v })
    }

    /// Serializes every entity in order.
    ///
    /// # Errors
    ///
    /// Fails on the first entity that cannot be serialized.
    pub fn to_rows<'a, I>(&self, db_set: &DbSetInfo, entities: I) -> Result<Vec<Row>, CoreError>
    where
        I: IntoIterator<Item = &'a dyn Entity>,
    {
        entities
            .into_iter()
            .map(|e| self.to_row(db_set, e))
            .collect()
    }

    /// Serializes entities skipping repeated composite keys. The first
    /// occurrence of a key wins.
    ///
    /// # Errors
    ///
    /// Fails on the first entity that cannot be serialized.
    pub fn to_distinct_rows<'a, I>(
        &self,
        db_set: &DbSetInfo,
        entities: I,
    ) -> Result<Vec<Row>, CoreError>
    where
        I: IntoIterator<Item = &'a dyn Entity>,
    {
        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        for entity in entities {
            let key = self.row_key(db_set, entity)?;
            if seen.contains(&key) {
                continue;
            }
            let row = self.to_row(db_set, entity)?;
            seen.insert(key);
            rows.push(row);
        }
        Ok(rows)
    }

    /// Column headers matching [`to_row`](Self::to_row) output.
    #[must_use]
    pub fn field_names(db_set: &DbSetInfo) -> Vec<FieldName> {
        fn names(fields: &[Field]) -> Vec<FieldName> {
            row_fields(fields)
                .map(|f| FieldName {
                    n: f.field_name.clone(),
                    p: f.is_object().then(|| names(&f.nested)),
                })
                .collect()
        }
        names(&db_set.fields)
    }

    /// Applies a serialized row onto `entity`, reversing [`to_row`](Self::to_row).
    /// Server-calculated fields are not written back.
    ///
    /// # Errors
    ///
    /// Fails when the row shape does not match the metadata or a value cannot
    /// be parsed or assigned.
    pub fn from_row(
        &self,
        db_set: &DbSetInfo,
        row: &Row,
        entity: &mut dyn Entity,
    ) -> Result<(), CoreError> {
        self.apply_wire(&db_set.db_set_name, &db_set.fields, &row.v, entity)
    }

    fn apply_wire(
        &self,
        owner: &str,
        fields: &[Field],
        values: &[WireValue],
        entity: &mut dyn Entity,
    ) -> Result<(), CoreError> {
        let fields: Vec<&Field> = row_fields(fields).collect();
        if fields.len() != values.len() {
            return Err(CoreError::conversion(
                owner,
                format!("row has {} values, expected {}", values.len(), fields.len()),
            ));
        }
        for (field, value) in fields.into_iter().zip(values) {
            match (field.is_object(), value) {
                (true, WireValue::Nested(nested)) => {
                    self.apply_wire(&field.full_name, &field.nested, nested, entity)?;
                }
                (true, WireValue::Null) => set_path(entity, &field.full_name, Value::Null)?,
                (false, WireValue::Null | WireValue::Text(_)) => {
                    if field.kind == FieldKind::ServerCalculated {
                        continue;
                    }
                    let parsed = self.converter.deserialize(field, value.as_text())?;
                    set_path(entity, &field.full_name, parsed)?;
                }
                _ => {
                    return Err(CoreError::conversion(
                        &field.full_name,
                        "value shape does not match field kind",
                    ))
                }
            }
        }
        Ok(())
    }

    /// Copies submitted values onto `entity` according to `mode`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownField`] for values naming unknown fields,
    /// [`CoreError::ReadOnlyField`] when an update changes a read-only field,
    /// and conversion errors.
    pub fn apply_values(
        &self,
        db_set: &DbSetInfo,
        entity: &mut dyn Entity,
        values: &[ValueChange],
        mode: ApplyMode,
    ) -> Result<(), CoreError> {
        self.apply_level(&db_set.db_set_name, &db_set.fields, entity, values, mode)
    }

    fn apply_level(
        &self,
        owner: &str,
        fields: &[Field],
        entity: &mut dyn Entity,
        values: &[ValueChange],
        mode: ApplyMode,
    ) -> Result<(), CoreError> {
        for vc in values {
            let field = fields
                .iter()
                .find(|f| f.field_name == vc.field_name)
                .ok_or_else(|| CoreError::UnknownField {
                    owner: owner.to_string(),
                    field: vc.field_name.clone(),
                })?;
            if !field.is_row_field() || field.kind == FieldKind::ServerCalculated {
                continue;
            }
            if field.is_object() {
                self.apply_level(&field.full_name, &field.nested, entity, &vc.nested, mode)?;
                continue;
            }
            let text = match mode {
                ApplyMode::Insert => {
                    if field.is_read_only && !(field.allow_client_default && vc.is_set()) {
                        continue;
                    }
                    vc.val.as_deref()
                }
                ApplyMode::Update => {
                    if field.is_read_only && vc.is_changed() && !field.allow_client_default {
                        return Err(CoreError::ReadOnlyField {
                            field: field.full_name.clone(),
                        });
                    }
                    vc.val.as_deref()
                }
                ApplyMode::Original => {
                    if vc.is_changed() {
                        vc.orig.as_deref()
                    } else {
                        vc.val.as_deref()
                    }
                }
            };
            let value = self.converter.deserialize(field, text)?;
            set_path(entity, &field.full_name, value)?;
        }
        Ok(())
    }

    /// Current values of every row field of `entity`, without flags.
    ///
    /// # Errors
    ///
    /// Fails on conversion errors.
    pub fn values_of(
        &self,
        db_set: &DbSetInfo,
        entity: &dyn Entity,
    ) -> Result<Vec<ValueChange>, CoreError> {
        self.values_level(&db_set.fields, entity)
    }

    fn values_level(&self, fields: &[Field], entity: &dyn Entity) -> Result<Vec<ValueChange>, CoreError> {
        row_fields(fields)
            .map(|f| {
                if f.is_object() {
                    Ok(ValueChange::object(
                        f.field_name.clone(),
                        self.values_level(&f.nested, entity)?,
                    ))
                } else {
                    let value = get_path(entity, &f.full_name).unwrap_or(Value::Null);
                    let text = self.converter.serialize(f, &value)?;
                    Ok(ValueChange::new(f.field_name.clone(), text.as_deref()))
                }
            })
            .collect()
    }

    /// Rewrites `values` with the entity's current state. Values that differ
    /// from what was submitted (a missing value counts as null) are flagged
    /// [`ValueFlags::REFRESHED`]. Returns the number of refreshed values.
    ///
    /// # Errors
    ///
    /// Fails on conversion errors.
    pub fn refresh_values(
        &self,
        db_set: &DbSetInfo,
        entity: &dyn Entity,
        values: &mut Vec<ValueChange>,
    ) -> Result<usize, CoreError> {
        self.refresh_level(&db_set.fields, entity, values)
    }

    fn refresh_level(
        &self,
        fields: &[Field],
        entity: &dyn Entity,
        values: &mut Vec<ValueChange>,
    ) -> Result<usize, CoreError> {
        let mut refreshed = 0;
        for field in row_fields(fields) {
            let idx = match values.iter().position(|v| v.field_name == field.field_name) {
                Some(idx) => idx,
                None => {
                    values.push(if field.is_object() {
                        ValueChange::object(field.field_name.clone(), Vec::new())
                    } else {
                        ValueChange::new(field.field_name.clone(), None)
                    });
                    values.len() - 1
                }
            };
            let vc = &mut values[idx];
            if field.is_object() {
                refreshed += self.refresh_level(&field.nested, entity, &mut vc.nested)?;
                continue;
            }
            let value = get_path(entity, &field.full_name).unwrap_or(Value::Null);
            let current = self.converter.serialize(field, &value)?;
            if current != vc.val {
                vc.val = current;
                if !vc.flags.contains(ValueFlags::REFRESHED) {
                    vc.flags.insert(ValueFlags::REFRESHED);
                    refreshed += 1;
                }
            }
        }
        Ok(refreshed)
    }
}
