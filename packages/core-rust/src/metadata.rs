//! Static description of a data service: entity collections (`DbSet`s), their
//! fields, associations between them, and the operation methods bound to
//! each collection together with their authorization attributes.
//!
//! Metadata is assembled through [`ServiceMetadata::builder`], validated once
//! and then shared read-only (`Arc`) for the lifetime of the service.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Field
// ---------------------------------------------------------------------------

/// Scalar data type tag of a field. Object-typed fields use [`DataType::None`]
/// together with [`FieldKind::Object`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataType {
    None,
    String,
    Bool,
    Integer,
    Decimal,
    Float,
    DateTime,
    Date,
    Time,
    Guid,
    Binary,
}

/// How date values are shifted between the server's native representation
/// and the UTC wire string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DateConversion {
    /// Written and read as-is.
    #[default]
    None,
    /// Native value is server-local time; the wire carries UTC.
    ServerLocalToClientLocal,
    /// Native value is already UTC.
    UtcToClientLocal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldKind {
    /// Stored scalar value.
    #[default]
    Data,
    /// Computed on the client only; never part of a row.
    Calculated,
    /// Navigation property to a related entity; never part of a row.
    Navigation,
    /// Computed by the server and sent to the client read-only.
    ServerCalculated,
    /// Complex value with its own nested field list.
    Object,
}

/// Description of one entity property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub field_name: String,
    /// Dotted path from the entity root (`Address.City`). Assigned when the
    /// owning metadata is built.
    pub full_name: String,
    pub data_type: DataType,
    pub kind: FieldKind,
    /// Position within the primary key, 1-based. 0 means not part of the key.
    pub primary_key: u16,
    pub is_nullable: bool,
    pub is_read_only: bool,
    pub is_auto_generated: bool,
    pub is_row_version: bool,
    pub is_concurrency_check: bool,
    /// Accept client-submitted values for read-only/generated fields on insert.
    pub allow_client_default: bool,
    pub max_length: Option<usize>,
    pub regex: Option<String>,
    /// Inclusive range as `"min,max"`; either side may be empty.
    pub range: Option<String>,
    pub date_conversion: DateConversion,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nested: Vec<Field>,
}

impl Field {
    /// Creates a nullable, writable data field.
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        let field_name = name.into();
        Self {
            full_name: field_name.clone(),
            field_name,
            data_type,
            kind: FieldKind::Data,
            primary_key: 0,
            is_nullable: true,
            is_read_only: false,
            is_auto_generated: false,
            is_row_version: false,
            is_concurrency_check: false,
            allow_client_default: false,
            max_length: None,
            regex: None,
            range: None,
            date_conversion: DateConversion::None,
            nested: Vec::new(),
        }
    }

    /// Creates an object-typed field holding `nested` fields in order.
    #[must_use]
    pub fn object(name: impl Into<String>, nested: Vec<Field>) -> Self {
        let mut field = Self::new(name, DataType::None);
        field.kind = FieldKind::Object;
        field.nested = nested;
        field
    }

    /// Marks the field as primary key member at `order` (1-based). Key fields
    /// are never nullable.
    #[must_use]
    pub fn primary_key(mut self, order: u16) -> Self {
        self.primary_key = order;
        self.is_nullable = false;
        self
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.is_nullable = false;
        self
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.is_read_only = true;
        self
    }

    /// Store-generated value (identity column). Implies read-only.
    #[must_use]
    pub fn auto_generated(mut self) -> Self {
        self.is_auto_generated = true;
        self.is_read_only = true;
        self
    }

    #[must_use]
    pub fn row_version(mut self) -> Self {
        self.is_row_version = true;
        self.is_read_only = true;
        self
    }

    #[must_use]
    pub fn concurrency_check(mut self) -> Self {
        self.is_concurrency_check = true;
        self
    }

    #[must_use]
    pub fn allow_client_default(mut self) -> Self {
        self.allow_client_default = true;
        self
    }

    #[must_use]
    pub fn max_length(mut self, len: usize) -> Self {
        self.max_length = Some(len);
        self
    }

    #[must_use]
    pub fn regex(mut self, pattern: impl Into<String>) -> Self {
        self.regex = Some(pattern.into());
        self
    }

    #[must_use]
    pub fn range(mut self, range: impl Into<String>) -> Self {
        self.range = Some(range.into());
        self
    }

    #[must_use]
    pub fn kind(mut self, kind: FieldKind) -> Self {
        self.kind = kind;
        if matches!(kind, FieldKind::ServerCalculated | FieldKind::Calculated) {
            self.is_read_only = true;
        }
        self
    }

    #[must_use]
    pub fn date_conversion(mut self, conversion: DateConversion) -> Self {
        self.date_conversion = conversion;
        self
    }

    #[must_use]
    pub fn is_primary_key(&self) -> bool {
        self.primary_key > 0
    }

    #[must_use]
    pub fn is_object(&self) -> bool {
        self.kind == FieldKind::Object
    }

    /// Whether the field takes part in the row wire format.
    #[must_use]
    pub fn is_row_field(&self) -> bool {
        matches!(
            self.kind,
            FieldKind::Data | FieldKind::ServerCalculated | FieldKind::Object
        )
    }

    /// Fields whose submitted original value is compared for optimistic
    /// concurrency.
    #[must_use]
    pub fn needs_original(&self) -> bool {
        self.is_primary_key() || self.is_row_version || self.is_concurrency_check
    }

    fn assign_full_names(&mut self, prefix: &str) {
        self.full_name = if prefix.is_empty() {
            self.field_name.clone()
        } else {
            format!("{prefix}.{}", self.field_name)
        };
        let own = self.full_name.clone();
        for nested in &mut self.nested {
            nested.assign_full_names(&own);
        }
    }
}

/// Row fields of a field list, in declared order.
pub fn row_fields(fields: &[Field]) -> impl Iterator<Item = &Field> {
    fields.iter().filter(|f| f.is_row_field())
}

// ---------------------------------------------------------------------------
// Methods and authorization attributes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MethodType {
    Query,
    Insert,
    Update,
    Delete,
    Refresh,
    Validate,
    Invoke,
}

/// Who declares a bound method: the service itself or a named handler type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "name")]
pub enum MethodOwner {
    Service,
    Handler(String),
}

/// One authorization attribute attached to a service, handler or method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "rule")]
pub enum AuthorizeData {
    /// Requires an authenticated caller in any of `roles` (any role when empty).
    /// Combined with the requirement inherited from the enclosing scope.
    Authorize { roles: Vec<String> },
    /// Like `Authorize` but replaces the enclosing scope's requirement.
    Override { roles: Vec<String> },
    /// Always passes, regardless of enclosing scopes.
    AllowAnonymous,
}

impl AuthorizeData {
    #[must_use]
    pub fn roles(roles: &[&str]) -> Self {
        AuthorizeData::Authorize {
            roles: roles.iter().map(|r| (*r).to_string()).collect(),
        }
    }

    #[must_use]
    pub fn override_roles(roles: &[&str]) -> Self {
        AuthorizeData::Override {
            roles: roles.iter().map(|r| (*r).to_string()).collect(),
        }
    }
}

/// A bound operation method and the authorization attributes on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodInfoData {
    pub method_name: String,
    pub method_type: MethodType,
    pub owner: MethodOwner,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorize: Vec<AuthorizeData>,
}

impl MethodInfoData {
    #[must_use]
    pub fn new(name: impl Into<String>, method_type: MethodType) -> Self {
        Self {
            method_name: name.into(),
            method_type,
            owner: MethodOwner::Service,
            authorize: Vec::new(),
        }
    }

    #[must_use]
    pub fn owned_by(mut self, handler: impl Into<String>) -> Self {
        self.owner = MethodOwner::Handler(handler.into());
        self
    }

    #[must_use]
    pub fn authorize(mut self, rule: AuthorizeData) -> Self {
        self.authorize.push(rule);
        self
    }
}

/// Authorization attributes declared on a handler type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerInfo {
    pub name: String,
    pub authorize: Vec<AuthorizeData>,
}

// ---------------------------------------------------------------------------
// DbSetInfo
// ---------------------------------------------------------------------------

/// Metadata of one entity collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbSetInfo {
    pub db_set_name: String,
    pub entity_type: String,
    pub fields: Vec<Field>,
    /// Primary key field names ordered by key position. Computed on build.
    pub primary_keys: Vec<String>,
    pub enable_paging: bool,
    pub page_size: Option<u32>,
    pub is_track_changes: bool,
    pub methods: Vec<MethodInfoData>,
}

impl DbSetInfo {
    #[must_use]
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            db_set_name: name.into(),
            entity_type: entity_type.into(),
            fields: Vec::new(),
            primary_keys: Vec::new(),
            enable_paging: false,
            page_size: None,
            is_track_changes: false,
            methods: Vec::new(),
        }
    }

    #[must_use]
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub fn paging(mut self, page_size: u32) -> Self {
        self.enable_paging = true;
        self.page_size = Some(page_size);
        self
    }

    #[must_use]
    pub fn track_changes(mut self) -> Self {
        self.is_track_changes = true;
        self
    }

    /// Binds a method. A later binding of the same [`MethodType`] replaces the
    /// earlier one.
    #[must_use]
    pub fn method(mut self, method: MethodInfoData) -> Self {
        self.methods.retain(|m| m.method_type != method.method_type);
        self.methods.push(method);
        self
    }

    /// Binds query/insert/update/delete/refresh methods named after the set,
    /// all owned by `handler`.
    #[must_use]
    pub fn crud_methods(self, handler: &str) -> Self {
        let name = self.db_set_name.clone();
        [
            (MethodType::Query, format!("Read{name}")),
            (MethodType::Insert, format!("Insert{name}")),
            (MethodType::Update, format!("Update{name}")),
            (MethodType::Delete, format!("Delete{name}")),
            (MethodType::Refresh, format!("Refresh{name}")),
        ]
        .into_iter()
        .fold(self, |set, (ty, method)| {
            set.method(MethodInfoData::new(method, ty).owned_by(handler))
        })
    }

    #[must_use]
    pub fn method_info(&self, method_type: MethodType) -> Option<&MethodInfoData> {
        self.methods.iter().find(|m| m.method_type == method_type)
    }

    /// Looks up a top-level field by name.
    #[must_use]
    pub fn find_field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.field_name == name)
    }

    /// Looks up a field by dotted path, descending into object fields.
    #[must_use]
    pub fn field_by_path(&self, path: &str) -> Option<&Field> {
        let mut parts = path.split('.');
        let mut field = self.find_field(parts.next()?)?;
        for part in parts {
            field = field.nested.iter().find(|f| f.field_name == part)?;
        }
        Some(field)
    }

    /// Primary key fields in key order.
    pub fn pk_fields(&self) -> impl Iterator<Item = &Field> {
        self.primary_keys
            .iter()
            .filter_map(|name| self.find_field(name))
    }

    fn finalize(&mut self) -> Result<(), CoreError> {
        ensure_unique_names(&self.db_set_name, &self.fields)?;
        for field in &mut self.fields {
            field.assign_full_names("");
        }

        let mut keys: Vec<&Field> = self.fields.iter().filter(|f| f.is_primary_key()).collect();
        if keys.is_empty() {
            return Err(CoreError::InvalidMetadata(format!(
                "DbSet '{}' has no primary key field",
                self.db_set_name
            )));
        }
        if let Some(bad) = keys.iter().find(|f| f.kind != FieldKind::Data) {
            return Err(CoreError::InvalidMetadata(format!(
                "primary key field '{}' of '{}' must be a data field",
                bad.field_name, self.db_set_name
            )));
        }
        keys.sort_by_key(|f| f.primary_key);
        self.primary_keys = keys.iter().map(|f| f.field_name.clone()).collect();
        Ok(())
    }
}

fn ensure_unique_names(owner: &str, fields: &[Field]) -> Result<(), CoreError> {
    let mut seen = BTreeSet::new();
    for field in fields {
        if !seen.insert(field.field_name.as_str()) {
            return Err(CoreError::InvalidMetadata(format!(
                "duplicate field '{}' in '{owner}'",
                field.field_name
            )));
        }
        if field.is_object() {
            ensure_unique_names(&field.field_name, &field.nested)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Association
// ---------------------------------------------------------------------------

/// A parent field / child field pair implementing the foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldRel {
    pub parent_field: String,
    pub child_field: String,
}

/// Named parent/child relationship between two collections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Association {
    pub name: String,
    pub parent_db_set: String,
    pub child_db_set: String,
    /// Navigation property on the child pointing at its parent.
    pub child_to_parent: Option<String>,
    /// Navigation property on the parent listing its children.
    pub parent_to_children: Option<String>,
    pub field_rels: Vec<FieldRel>,
    pub on_delete_cascade: bool,
}

impl Association {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        parent_db_set: impl Into<String>,
        child_db_set: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            parent_db_set: parent_db_set.into(),
            child_db_set: child_db_set.into(),
            child_to_parent: None,
            parent_to_children: None,
            field_rels: Vec::new(),
            on_delete_cascade: false,
        }
    }

    #[must_use]
    pub fn rel(mut self, parent_field: impl Into<String>, child_field: impl Into<String>) -> Self {
        self.field_rels.push(FieldRel {
            parent_field: parent_field.into(),
            child_field: child_field.into(),
        });
        self
    }

    #[must_use]
    pub fn navigation(
        mut self,
        child_to_parent: impl Into<String>,
        parent_to_children: impl Into<String>,
    ) -> Self {
        self.child_to_parent = Some(child_to_parent.into());
        self.parent_to_children = Some(parent_to_children.into());
        self
    }
}

// ---------------------------------------------------------------------------
// ServiceMetadata
// ---------------------------------------------------------------------------

/// Complete, validated metadata of a data service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceMetadata {
    pub db_sets: BTreeMap<String, Arc<DbSetInfo>>,
    pub associations: BTreeMap<String, Arc<Association>>,
    pub handlers: BTreeMap<String, HandlerInfo>,
    /// Service-level authorization attributes.
    pub authorize: Vec<AuthorizeData>,
    /// Free-standing invoke methods, keyed by method name.
    pub invoke_methods: BTreeMap<String, MethodInfoData>,
}

impl ServiceMetadata {
    #[must_use]
    pub fn builder() -> ServiceMetadataBuilder {
        ServiceMetadataBuilder::default()
    }

    #[must_use]
    pub fn db_set(&self, name: &str) -> Option<&Arc<DbSetInfo>> {
        self.db_sets.get(name)
    }

    #[must_use]
    pub fn association(&self, name: &str) -> Option<&Arc<Association>> {
        self.associations.get(name)
    }

    /// Associations in which `db_set` is the child.
    pub fn parent_associations<'a>(
        &'a self,
        db_set: &'a str,
    ) -> impl Iterator<Item = &'a Arc<Association>> {
        self.associations
            .values()
            .filter(move |a| a.child_db_set == db_set)
    }
}

/// Collects metadata parts and validates them in [`build`](Self::build).
#[derive(Debug, Default)]
pub struct ServiceMetadataBuilder {
    db_sets: Vec<DbSetInfo>,
    associations: Vec<Association>,
    handlers: Vec<HandlerInfo>,
    authorize: Vec<AuthorizeData>,
    invoke_methods: Vec<MethodInfoData>,
}

impl ServiceMetadataBuilder {
    #[must_use]
    pub fn db_set(mut self, db_set: DbSetInfo) -> Self {
        self.db_sets.push(db_set);
        self
    }

    #[must_use]
    pub fn association(mut self, association: Association) -> Self {
        self.associations.push(association);
        self
    }

    #[must_use]
    pub fn handler(mut self, name: impl Into<String>, authorize: Vec<AuthorizeData>) -> Self {
        self.handlers.push(HandlerInfo {
            name: name.into(),
            authorize,
        });
        self
    }

    #[must_use]
    pub fn authorize(mut self, rule: AuthorizeData) -> Self {
        self.authorize.push(rule);
        self
    }

    #[must_use]
    pub fn invoke_method(mut self, method: MethodInfoData) -> Self {
        let mut method = method;
        method.method_type = MethodType::Invoke;
        self.invoke_methods.push(method);
        self
    }

    /// Validates and freezes the metadata.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidMetadata`] for duplicate names, sets without
    /// a primary key, associations naming unknown sets or fields, and methods
    /// owned by undeclared handlers.
    pub fn build(self) -> Result<ServiceMetadata, CoreError> {
        let mut handlers = BTreeMap::new();
        for handler in self.handlers {
            let name = handler.name.clone();
            if handlers.insert(name.clone(), handler).is_some() {
                return Err(CoreError::InvalidMetadata(format!("duplicate handler '{name}'")));
            }
        }

        let mut db_sets = BTreeMap::new();
        for mut db_set in self.db_sets {
            db_set.finalize()?;
            for method in &db_set.methods {
                check_owner(&handlers, method)?;
            }
            let name = db_set.db_set_name.clone();
            if db_sets.insert(name.clone(), Arc::new(db_set)).is_some() {
                return Err(CoreError::InvalidMetadata(format!("duplicate DbSet '{name}'")));
            }
        }

        let mut associations = BTreeMap::new();
        for assoc in self.associations {
            validate_association(&db_sets, &assoc)?;
            let name = assoc.name.clone();
            if associations.insert(name.clone(), Arc::new(assoc)).is_some() {
                return Err(CoreError::InvalidMetadata(format!(
                    "duplicate association '{name}'"
                )));
            }
        }

        let mut invoke_methods = BTreeMap::new();
        for method in self.invoke_methods {
            check_owner(&handlers, &method)?;
            let name = method.method_name.clone();
            if invoke_methods.insert(name.clone(), method).is_some() {
                return Err(CoreError::InvalidMetadata(format!(
                    "duplicate invoke method '{name}'"
                )));
            }
        }

        Ok(ServiceMetadata {
            db_sets,
            associations,
            handlers,
            authorize: self.authorize,
            invoke_methods,
        })
    }
}

fn check_owner(
    handlers: &BTreeMap<String, HandlerInfo>,
    method: &MethodInfoData,
) -> Result<(), CoreError> {
    match &method.owner {
        MethodOwner::Handler(name) if !handlers.contains_key(name) => {
            Err(CoreError::InvalidMetadata(format!(
                "method '{}' is owned by undeclared handler '{name}'",
                method.method_name
            )))
        }
        _ => Ok(()),
    }
}

fn validate_association(
    db_sets: &BTreeMap<String, Arc<DbSetInfo>>,
    assoc: &Association,
) -> Result<(), CoreError> {
    let lookup = |name: &str| {
        db_sets.get(name).ok_or_else(|| {
            CoreError::InvalidMetadata(format!(
                "association '{}' references unknown DbSet '{name}'",
                assoc.name
            ))
        })
    };
    let parent = lookup(&assoc.parent_db_set)?;
    let child = lookup(&assoc.child_db_set)?;

    if assoc.field_rels.is_empty() {
        return Err(CoreError::InvalidMetadata(format!(
            "association '{}' declares no field pairs",
            assoc.name
        )));
    }
    for rel in &assoc.field_rels {
        if parent.find_field(&rel.parent_field).is_none() {
            return Err(CoreError::UnknownField {
                owner: parent.db_set_name.clone(),
                field: rel.parent_field.clone(),
            });
        }
        if child.find_field(&rel.child_field).is_none() {
            return Err(CoreError::UnknownField {
                owner: child.db_set_name.clone(),
                field: rel.child_field.clone(),
            });
        }
    }
    Ok(())
}
