//! Declarations of the record types ("entities") pulled from the budgeting API.

use serde::{Deserialize, Serialize};

pub const ACCOUNTS: &str = "accounts";
pub const CATEGORIES: &str = "categories";
pub const MONTHS: &str = "months";
pub const PAYEES: &str = "payees";
pub const TRANSACTIONS: &str = "transactions";
pub const SCHEDULED_TRANSACTIONS: &str = "scheduled_transactions";

/// One entity as declared in `config.json`.
///
/// ```json
/// { "name": "categories", "unique_id": "id",
///   "groups": { "container": "category_groups", "children": "categories" } }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Entity {
    /// The API path segment, the raw/processed partition name and the base table name.
    name: String,

    /// The field that identifies a record. Assumed immutable once first observed.
    unique_id: String,

    /// Present when the payload arrives nested inside group objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    groups: Option<Groups>,
}

/// Describes a grouped payload: `{ <container>: [ { <children>: [record, ...] }, ... ] }`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Groups {
    pub container: String,
    pub children: String,
}

impl Entity {
    pub fn new(name: impl Into<String>, unique_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unique_id: unique_id.into(),
            groups: None,
        }
    }

    pub fn grouped(
        name: impl Into<String>,
        unique_id: impl Into<String>,
        container: impl Into<String>,
        children: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            unique_id: unique_id.into(),
            groups: Some(Groups {
                container: container.into(),
                children: children.into(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn groups(&self) -> Option<&Groups> {
        self.groups.as_ref()
    }
}

/// The entity list written by `budget init`, in fetch order.
pub fn defaults() -> Vec<Entity> {
    vec![
        Entity::new(ACCOUNTS, "id"),
        Entity::grouped(CATEGORIES, "id", "category_groups", "categories"),
        Entity::new(MONTHS, "month"),
        Entity::new(PAYEES, "id"),
        Entity::new(TRANSACTIONS, "id"),
        Entity::new(SCHEDULED_TRANSACTIONS, "id"),
    ]
}

#[test]
fn test_flat_entity_omits_groups() {
    let json = serde_json::to_string(&Entity::new(PAYEES, "id")).unwrap();
    assert_eq!(json, r#"{"name":"payees","unique_id":"id"}"#);
}

#[test]
fn test_grouped_entity_round_trip() {
    let json = r#"{"name":"categories","unique_id":"id",
        "groups":{"container":"category_groups","children":"categories"}}"#;
    let entity: Entity = serde_json::from_str(json).unwrap();
    assert_eq!(entity, defaults()[1]);
}
