//! Uniform property access over statically typed and dynamically shaped entities.
//!
//! Calling code only ever sees [`Entity`] plus the dotted-path helpers
//! [`get_path`] / [`set_path`]; it never branches on the concrete shape.
//!
//! - [`DynamicEntity`]: map-backed ("expando") record.
//! - [`Record<T>`]: wraps a plain struct and dispatches through an
//!   [`AccessorTable`] of getter/setter closures built once per type.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::error::CoreError;
use crate::types::Value;

/// A native entity instance whose top-level properties can be read and written
/// by name.
pub trait Entity: Send + Sync + 'static {
    /// Entity type identity (matches `DbSetInfo::entity_type`).
    fn entity_type(&self) -> &str;

    /// Reads a top-level property. `None` when the property does not exist.
    fn get_value(&self, name: &str) -> Option<Value>;

    /// Writes a top-level property.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownField`] for unknown properties or
    /// [`CoreError::TypeMismatch`] when the value does not fit.
    fn set_value(&mut self, name: &str, value: Value) -> Result<(), CoreError>;

    fn clone_entity(&self) -> Box<dyn Entity>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl fmt::Debug for dyn Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("type", &self.entity_type())
            .finish_non_exhaustive()
    }
}

/// Reads a value by dotted path (`Address.City`), descending into object values.
///
/// A missing intermediate object yields `Some(Value::Null)` so nested fields
/// of a null object read as null.
#[must_use]
pub fn get_path(entity: &dyn Entity, path: &str) -> Option<Value> {
    let mut parts = path.split('.');
    let mut current = entity.get_value(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(mut map) => map.remove(part).unwrap_or(Value::Null),
            Value::Null => Value::Null,
            _ => return None,
        };
    }
    Some(current)
}

/// Writes a value by dotted path, creating intermediate objects as needed.
///
/// # Errors
///
/// Propagates the entity's `set_value` errors, and fails with
/// [`CoreError::TypeMismatch`] when an intermediate value is not an object.
pub fn set_path(entity: &mut dyn Entity, path: &str, value: Value) -> Result<(), CoreError> {
    let Some((root, rest)) = path.split_once('.') else {
        return entity.set_value(path, value);
    };
    let mut root_value = match entity.get_value(root) {
        Some(Value::Object(map)) => Value::Object(map),
        Some(Value::Null) | None => Value::Object(BTreeMap::new()),
        Some(other) => {
            return Err(CoreError::TypeMismatch {
                expected: "object",
                actual: other.type_name(),
            })
        }
    };
    set_in_object(&mut root_value, rest, value)?;
    entity.set_value(root, root_value)
}

fn set_in_object(target: &mut Value, path: &str, value: Value) -> Result<(), CoreError> {
    if target.is_null() {
        *target = Value::Object(BTreeMap::new());
    }
    let Value::Object(map) = target else {
        return Err(CoreError::TypeMismatch {
            expected: "object",
            actual: target.type_name(),
        });
    };
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
            Ok(())
        }
        Some((head, rest)) => {
            let child = map.entry(head.to_string()).or_insert(Value::Null);
            set_in_object(child, rest, value)
        }
    }
}

// ---------------------------------------------------------------------------
// DynamicEntity
// ---------------------------------------------------------------------------

/// Map-backed entity accepting any property name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DynamicEntity {
    entity_type: String,
    values: BTreeMap<String, Value>,
}

impl DynamicEntity {
    #[must_use]
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            values: BTreeMap::new(),
        }
    }

    /// Builder-style setter for tests and fixtures.
    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }
}

impl Entity for DynamicEntity {
    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn get_value(&self, name: &str) -> Option<Value> {
        Some(self.values.get(name).cloned().unwrap_or(Value::Null))
    }

    fn set_value(&mut self, name: &str, value: Value) -> Result<(), CoreError> {
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    fn clone_entity(&self) -> Box<dyn Entity> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Record<T> + AccessorTable<T>
// ---------------------------------------------------------------------------

type Getter<T> = Box<dyn Fn(&T) -> Value + Send + Sync>;
type Setter<T> = Box<dyn Fn(&mut T, Value) -> Result<(), CoreError> + Send + Sync>;

/// Per-type accessor delegates, built once and shared by every [`Record<T>`].
pub struct AccessorTable<T> {
    entity_type: String,
    getters: HashMap<String, Getter<T>>,
    setters: HashMap<String, Setter<T>>,
}

impl<T> AccessorTable<T> {
    #[must_use]
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            getters: HashMap::new(),
            setters: HashMap::new(),
        }
    }

    /// Registers a readable and writable property.
    #[must_use]
    pub fn field<G, S>(mut self, name: &str, get: G, set: S) -> Self
    where
        G: Fn(&T) -> Value + Send + Sync + 'static,
        S: Fn(&mut T, Value) -> Result<(), CoreError> + Send + Sync + 'static,
    {
        self.getters.insert(name.to_string(), Box::new(get));
        self.setters.insert(name.to_string(), Box::new(set));
        self
    }

    /// Registers a property that can only be read.
    #[must_use]
    pub fn read_only<G>(mut self, name: &str, get: G) -> Self
    where
        G: Fn(&T) -> Value + Send + Sync + 'static,
    {
        self.getters.insert(name.to_string(), Box::new(get));
        self
    }
}

impl<T> fmt::Debug for AccessorTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessorTable")
            .field("entity_type", &self.entity_type)
            .field("fields", &self.getters.len())
            .finish()
    }
}

/// A typed struct exposed as an [`Entity`].
#[derive(Debug)]
pub struct Record<T> {
    inner: T,
    table: Arc<AccessorTable<T>>,
}

impl<T> Record<T> {
    #[must_use]
    pub fn new(inner: T, table: Arc<AccessorTable<T>>) -> Self {
        Self { inner, table }
    }

    #[must_use]
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Clone> Clone for Record<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            table: Arc::clone(&self.table),
        }
    }
}

impl<T> Deref for Record<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for Record<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: Clone + Send + Sync + 'static> Entity for Record<T> {
    fn entity_type(&self) -> &str {
        &self.table.entity_type
    }

    fn get_value(&self, name: &str) -> Option<Value> {
        self.table.getters.get(name).map(|get| get(&self.inner))
    }

    fn set_value(&mut self, name: &str, value: Value) -> Result<(), CoreError> {
        match self.table.setters.get(name) {
            Some(set) => set(&mut self.inner, value),
            None if self.table.getters.contains_key(name) => Err(CoreError::ReadOnlyField {
                field: name.to_string(),
            }),
            None => Err(CoreError::UnknownField {
                owner: self.table.entity_type.clone(),
                field: name.to_string(),
            }),
        }
    }

    fn clone_entity(&self) -> Box<dyn Entity> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FromValue;

    #[derive(Debug, Clone, Default)]
    struct Product {
        name: String,
        price: Option<i64>,
    }

    fn product_table() -> Arc<AccessorTable<Product>> {
        Arc::new(
            AccessorTable::new("Product")
                .field(
                    "Name",
                    |p: &Product| Value::from(p.name.clone()),
                    |p: &mut Product, v| {
                        p.name = String::from_value(v)?;
                        Ok(())
                    },
                )
                .field(
                    "Price",
                    |p: &Product| Value::from(p.price),
                    |p: &mut Product, v| {
                        p.price = Option::from_value(v)?;
                        Ok(())
                    },
                )
                .read_only("Label", |p: &Product| Value::from(format!("#{}", p.name))),
        )
    }

    #[test]
    fn typed_record_reads_and_writes_through_table() {
        let mut record = Record::new(Product::default(), product_table());
        record.set_value("Name", Value::from("Pen")).unwrap();
        record.set_value("Price", Value::Int(3)).unwrap();
        assert_eq!(record.name, "Pen");
        assert_eq!(record.get_value("Price"), Some(Value::Int(3)));
        assert_eq!(record.get_value("Label"), Some(Value::from("#Pen")));
    }

    #[test]
    fn typed_record_rejects_unknown_and_read_only() {
        let mut record = Record::new(Product::default(), product_table());
        assert!(matches!(
            record.set_value("Nope", Value::Null),
            Err(CoreError::UnknownField { .. })
        ));
        assert!(matches!(
            record.set_value("Label", Value::Null),
            Err(CoreError::ReadOnlyField { .. })
        ));
    }

    #[test]
    fn dotted_paths_create_nested_objects() {
        let mut entity = DynamicEntity::new("Customer");
        set_path(&mut entity, "Address.City", Value::from("Oslo")).unwrap();
        set_path(&mut entity, "Address.Geo.Lat", Value::Int(59)).unwrap();
        assert_eq!(get_path(&entity, "Address.City"), Some(Value::from("Oslo")));
        assert_eq!(get_path(&entity, "Address.Geo.Lat"), Some(Value::Int(59)));
        assert_eq!(get_path(&entity, "Address.Zip"), Some(Value::Null));
    }

    #[test]
    fn nested_path_through_scalar_is_rejected() {
        let mut entity = DynamicEntity::new("Customer").with("Address", "flat");
        let err = set_path(&mut entity, "Address.City", Value::from("x")).unwrap_err();
        assert!(matches!(err, CoreError::TypeMismatch { expected: "object", .. }));
    }

    #[test]
    fn downcast_through_any() {
        let boxed: Box<dyn Entity> = Box::new(DynamicEntity::new("T").with("A", 1_i64));
        let concrete = boxed.as_any().downcast_ref::<DynamicEntity>().unwrap();
        assert_eq!(concrete.values().len(), 1);
    }
}
