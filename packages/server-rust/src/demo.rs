//! Demo service over the in-memory store: customers and their addresses.
//!
//! Used by the server binary and by the end-to-end tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rowsync_core::convert::{DefaultValueConverter, ValueConverter};
use rowsync_core::entity::{get_path, DynamicEntity, Entity};
use rowsync_core::error::CoreError;
use rowsync_core::messages::ValidationErrorInfo;
use rowsync_core::metadata::{
    Association, AuthorizeData, DataType, DbSetInfo, Field, MethodInfoData, MethodType,
    ServiceMetadata,
};
use rowsync_core::types::Value;
use serde_json::json;

use crate::service::{
    DataService, DataSession, InvokeHandler, MetadataCache, ModelValidator, ServiceConfig,
    ServiceDefinition,
};
use crate::storage::{MemorySessionFactory, MemoryStore};

pub const CUSTOMERS: &str = "Customer";
pub const ADDRESSES: &str = "CustomerAddress";
pub const CUSTOMER_ADDRESSES: &str = "CustomerAddresses";

/// Role required to delete customers.
pub const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone, Copy, Default)]
pub struct DemoService;

impl ServiceDefinition for DemoService {
    fn service_name() -> &'static str {
        "Demo"
    }

    fn build_metadata() -> Result<ServiceMetadata, CoreError> {
        ServiceMetadata::builder()
            .handler("Customers", Vec::new())
            .handler("Addresses", Vec::new())
            .db_set(
                DbSetInfo::new(CUSTOMERS, "Customer")
                    .field(
                        Field::new("CustomerId", DataType::Integer)
                            .primary_key(1)
                            .auto_generated(),
                    )
                    .field(Field::new("Name", DataType::String).required().max_length(50))
                    .field(Field::new("Email", DataType::String).regex(r"^[^@\s]+@[^@\s]+$"))
                    .field(Field::new("Level", DataType::Integer).range("1,5"))
                    .field(Field::new("RowVersion", DataType::Integer).row_version())
                    .field(Field::object(
                        "Address",
                        vec![
                            Field::new("Street", DataType::String),
                            Field::new("City", DataType::String).max_length(40),
                        ],
                    ))
                    .paging(25)
                    .track_changes()
                    .crud_methods("Customers")
                    .method(
                        MethodInfoData::new("DeleteCustomer", MethodType::Delete)
                            .owned_by("Customers")
                            .authorize(AuthorizeData::roles(&[ADMIN_ROLE])),
                    ),
            )
            .db_set(
                DbSetInfo::new(ADDRESSES, "CustomerAddress")
                    .field(
                        Field::new("AddressId", DataType::Integer)
                            .primary_key(1)
                            .auto_generated(),
                    )
                    .field(Field::new("CustomerId", DataType::Integer).required())
                    .field(Field::new("Line", DataType::String).required().max_length(80))
                    .field(Field::new("RowVersion", DataType::Integer).row_version())
                    .crud_methods("Addresses"),
            )
            .association(
                Association::new(CUSTOMER_ADDRESSES, CUSTOMERS, ADDRESSES)
                    .rel("CustomerId", "CustomerId")
                    .navigation("Customer", "Addresses"),
            )
            .invoke_method(MethodInfoData::new("CountCustomers", MethodType::Invoke))
            .build()
    }
}

/// A built demo service together with the store behind it.
#[derive(Debug, Clone)]
pub struct Demo {
    pub service: DataService,
    pub store: Arc<MemoryStore>,
}

/// Builds the demo service over a freshly seeded memory store.
///
/// # Errors
///
/// Fails when the metadata is invalid or the seed data is rejected.
pub fn build_demo(config: ServiceConfig) -> anyhow::Result<Demo> {
    let metadata = MetadataCache::global().get::<DemoService>()?;
    let converter: Arc<dyn ValueConverter> = Arc::new(DefaultValueConverter::new(config.server_offset()));
    let store = Arc::new(MemoryStore::new(Arc::clone(&metadata), Arc::clone(&converter)));
    store.seed(CUSTOMERS, seed_customers())?;
    store.seed(ADDRESSES, seed_addresses())?;

    let service = DataService::builder(DemoService::service_name(), metadata)
        .config(config)
        .converter(converter)
        .sessions(Arc::new(MemorySessionFactory::new(Arc::clone(&store))))
        .model_validator(CUSTOMERS, Arc::new(ReservedNames))
        .invoke_handler(
            "CountCustomers",
            Arc::new(CountCustomers {
                store: Arc::clone(&store),
            }),
        )
        .build()?;
    Ok(Demo { service, store })
}

fn customer(id: i64, name: &str, city: &str) -> Box<dyn Entity> {
    let address = BTreeMap::from([
        ("Street".to_string(), Value::Null),
        ("City".to_string(), Value::from(city)),
    ]);
    Box::new(
        DynamicEntity::new("Customer")
            .with("CustomerId", id)
            .with("Name", name)
            .with("Email", Value::Null)
            .with("Level", 1i64)
            .with("RowVersion", 1i64)
            .with("Address", Value::Object(address)),
    )
}

fn seed_customers() -> Vec<Box<dyn Entity>> {
    vec![
        customer(1, "Ada", "London"),
        customer(2, "Grace", "Arlington"),
        customer(3, "Edsger", "Nuenen"),
    ]
}

fn seed_addresses() -> Vec<Box<dyn Entity>> {
    vec![Box::new(
        DynamicEntity::new("CustomerAddress")
            .with("AddressId", 1i64)
            .with("CustomerId", 1i64)
            .with("Line", "12 St James's Square")
            .with("RowVersion", 1i64),
    )]
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Rejects customer names reserved for system accounts.
struct ReservedNames;

const RESERVED: [&str; 2] = ["admin", "system"];

#[async_trait]
impl ModelValidator for ReservedNames {
    async fn validate(
        &self,
        entity: &dyn Entity,
        modified: &[String],
    ) -> anyhow::Result<Vec<ValidationErrorInfo>> {
        if !modified.iter().any(|m| m == "Name") {
            return Ok(Vec::new());
        }
        let reserved = get_path(entity, "Name")
            .as_ref()
            .and_then(Value::as_str)
            .is_some_and(|name| RESERVED.iter().any(|r| r.eq_ignore_ascii_case(name)));
        Ok(if reserved {
            vec![ValidationErrorInfo::field("Name", "this name is reserved")]
        } else {
            Vec::new()
        })
    }
}

struct CountCustomers {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl InvokeHandler for CountCustomers {
    async fn invoke(
        &self,
        _session: &dyn DataSession,
        params: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let snapshot = self.store.snapshot();
        let Some(table) = snapshot.table(CUSTOMERS) else {
            return Ok(json!({ "count": 0 }));
        };
        let city = params.get("city").and_then(serde_json::Value::as_str);
        let count = table
            .values()
            .filter(|c| {
                city.map_or(true, |city| {
                    get_path(c.as_ref(), "Address.City").as_ref().and_then(Value::as_str)
                        == Some(city)
                })
            })
            .count();
        Ok(json!({ "count": count, "version": snapshot.version() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_metadata_builds() {
        let metadata = DemoService::build_metadata().unwrap();
        assert_eq!(metadata.db_sets.len(), 2);
        let customers = metadata.db_set(CUSTOMERS).unwrap();
        let delete = customers.method_info(MethodType::Delete).unwrap();
        assert_eq!(delete.method_name, "DeleteCustomer");
        assert!(metadata.association(CUSTOMER_ADDRESSES).is_some());
    }

    #[test]
    fn demo_store_is_seeded() {
        let demo = build_demo(ServiceConfig::default()).unwrap();
        assert_eq!(demo.store.len(CUSTOMERS), 3);
        assert_eq!(demo.store.len(ADDRESSES), 1);
        assert_eq!(demo.store.next_key(CUSTOMERS), 4);
    }
}
