//! Implements the `Budget` trait using in-memory data for testing purposes.
//!
//! Note: this is compiled even in the "production" version of this app so that we can run the whole
//! pipeline, top-to-bottom, without the network.

use crate::api::{Budget, Reply};
use crate::entity::{ACCOUNTS, CATEGORIES, MONTHS, PAYEES, SCHEDULED_TRANSACTIONS, TRANSACTIONS};
use crate::knowledge::Cursor;
use crate::Result;
use anyhow::anyhow;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use tracing::trace;

const SEED_KNOWLEDGE: i64 = 1;
const SEED_RATE_LIMIT: &str = "1/200";

/// A scripted or seeded stand-in for the API.
///
/// Scripted responses are served first, in order, per entity. Once an entity's script runs out,
/// the seed data answers: the full seed for any cursor other than the seed's knowledge, and an
/// empty delta otherwise. Entities with neither get a 404.
pub(crate) struct TestBudget {
    script: HashMap<String, VecDeque<Scripted>>,
    seed: HashMap<String, Value>,
    calls: Vec<(String, Cursor)>,
}

/// One scripted answer. `Err` simulates a transport failure.
pub(crate) type Scripted = std::result::Result<Reply, String>;

impl TestBudget {
    /// A client with no seed data, answering only what is scripted.
    pub(crate) fn empty() -> Self {
        Self {
            script: HashMap::new(),
            seed: HashMap::new(),
            calls: Vec::new(),
        }
    }

    /// Queues `scripted` as the next answer for `entity`.
    #[cfg(test)]
    pub(crate) fn push(&mut self, entity: &str, scripted: Scripted) -> &mut Self {
        self.script
            .entry(entity.to_string())
            .or_default()
            .push_back(scripted);
        self
    }

    /// Queues a 200 response shaped like the real API: `{"data": {...data, server_knowledge}}`.
    #[cfg(test)]
    pub(crate) fn push_data(&mut self, entity: &str, data: Value, knowledge: i64) -> &mut Self {
        self.push(entity, Ok(ok_reply(data, knowledge)))
    }

    /// Every `(entity, cursor)` requested so far, in order.
    #[cfg(test)]
    pub(crate) fn calls(&self) -> &[(String, Cursor)] {
        &self.calls
    }
}

#[async_trait::async_trait]
impl Budget for TestBudget {
    async fn get(&mut self, entity: &str, cursor: &Cursor) -> Result<Reply> {
        self.calls.push((entity.to_string(), cursor.clone()));
        trace!("Test request #{} for {entity} since {cursor}", self.calls.len());
        if let Some(next) = self.script.get_mut(entity).and_then(VecDeque::pop_front) {
            return next.map_err(|message| anyhow!(message));
        }
        let Some(data) = self.seed.get(entity) else {
            return Ok(Reply::new(
                404,
                Some(SEED_RATE_LIMIT),
                json!({"error": {"id": "404.2", "name": "resource_not_found"}}).to_string(),
            ));
        };
        if *cursor == Cursor::Number(SEED_KNOWLEDGE) {
            return Ok(ok_reply(empty_delta(data), SEED_KNOWLEDGE));
        }
        Ok(ok_reply(data.clone(), SEED_KNOWLEDGE))
    }
}

impl Default for TestBudget {
    /// Loads seed data from this module.
    fn default() -> Self {
        let mut seed = HashMap::new();
        seed.insert(
            ACCOUNTS.to_string(),
            json!({ "accounts": [
                { "id": "acct-checking", "name": "Checking", "type": "checking", "on_budget": true,
                  "closed": false, "note": null, "balance": 250000, "cleared_balance": 240000,
                  "uncleared_balance": 10000, "transfer_payee_id": "payee-xfer-checking",
                  "deleted": false },
                { "id": "acct-card", "name": "Credit Card", "type": "creditCard", "on_budget": true,
                  "closed": false, "note": "rewards card", "balance": -45000,
                  "cleared_balance": -45000, "uncleared_balance": 0,
                  "transfer_payee_id": "payee-xfer-card", "deleted": false }
            ]}),
        );
        seed.insert(
            CATEGORIES.to_string(),
            json!({ "category_groups": [
                { "id": "grp-food", "name": "Food", "hidden": false, "deleted": false,
                  "categories": [
                    { "id": "cat-groceries", "category_group_id": "grp-food",
                      "category_group_name": "Food", "name": "Groceries", "hidden": false,
                      "note": null, "budgeted": 60000, "activity": -8743, "balance": 51257,
                      "deleted": false },
                    { "id": "cat-coffee", "category_group_id": "grp-food",
                      "category_group_name": "Food", "name": "Coffee Shops", "hidden": false,
                      "note": "treats", "budgeted": 5000, "activity": -675, "balance": 4325,
                      "deleted": false }
                ]},
                { "id": "grp-home", "name": "Home", "hidden": false, "deleted": false,
                  "categories": [
                    { "id": "cat-utilities", "category_group_id": "grp-home",
                      "category_group_name": "Home", "name": "Utilities", "hidden": false,
                      "note": null, "budgeted": 20000, "activity": -14267, "balance": 5733,
                      "deleted": false }
                ]}
            ]}),
        );
        seed.insert(
            MONTHS.to_string(),
            json!({ "months": [
                { "month": "2025-10-01", "note": null, "income": 500000, "budgeted": 85000,
                  "activity": -23685, "to_be_budgeted": 415000, "deleted": false }
            ]}),
        );
        seed.insert(
            PAYEES.to_string(),
            json!({ "payees": [
                { "id": "payee-wholefoods", "name": "Whole Foods Market",
                  "transfer_account_id": null, "deleted": false },
                { "id": "payee-starbucks", "name": "Starbucks", "transfer_account_id": null,
                  "deleted": false },
                { "id": "payee-pge", "name": "PG&E Electric", "transfer_account_id": null,
                  "deleted": false }
            ]}),
        );
        seed.insert(
            TRANSACTIONS.to_string(),
            json!({ "transactions": [
                { "id": "tx-001", "date": "2025-10-20", "amount": -8743, "memo": null,
                  "cleared": "cleared", "approved": true, "flag_color": null,
                  "account_id": "acct-card", "payee_id": "payee-wholefoods",
                  "category_id": "cat-groceries", "transfer_account_id": null,
                  "account_name": "Credit Card", "payee_name": "Whole Foods Market",
                  "category_name": "Groceries", "subtransactions": [], "deleted": false },
                { "id": "tx-002", "date": "2025-10-19", "amount": -675, "memo": "latte",
                  "cleared": "uncleared", "approved": true, "flag_color": "red",
                  "account_id": "acct-card", "payee_id": "payee-starbucks",
                  "category_id": "cat-coffee", "transfer_account_id": null,
                  "account_name": "Credit Card", "payee_name": "Starbucks",
                  "category_name": "Coffee Shops", "subtransactions": [], "deleted": false },
                { "id": "tx-003", "date": "2025-10-16", "amount": -14267, "memo": null,
                  "cleared": "cleared", "approved": true, "flag_color": null,
                  "account_id": "acct-checking", "payee_id": "payee-pge",
                  "category_id": "cat-utilities", "transfer_account_id": null,
                  "account_name": "Checking", "payee_name": "PG&E Electric",
                  "category_name": "Utilities", "subtransactions": [], "deleted": false }
            ]}),
        );
        seed.insert(
            SCHEDULED_TRANSACTIONS.to_string(),
            json!({ "scheduled_transactions": [
                { "id": "sched-rent", "date_first": "2025-01-01", "date_next": "2025-11-01",
                  "frequency": "monthly", "amount": -150000, "memo": null, "flag_color": null,
                  "account_id": "acct-checking", "payee_id": "payee-pge",
                  "category_id": "cat-utilities", "transfer_account_id": null,
                  "account_name": "Checking", "payee_name": "PG&E Electric",
                  "category_name": "Utilities", "subtransactions": [], "deleted": false }
            ]}),
        );
        Self {
            seed,
            ..Self::empty()
        }
    }
}

fn ok_reply(mut data: Value, knowledge: i64) -> Reply {
    if let Some(map) = data.as_object_mut() {
        map.insert("server_knowledge".to_string(), json!(knowledge));
    }
    Reply::new(
        200,
        Some(SEED_RATE_LIMIT),
        json!({ "data": data }).to_string(),
    )
}

/// The same payload with every top-level list emptied.
fn empty_delta(data: &Value) -> Value {
    let mut data = data.clone();
    if let Some(map) = data.as_object_mut() {
        for value in map.values_mut() {
            if value.is_array() {
                *value = json!([]);
            }
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_seed() {
        let mut budget = TestBudget::default();
        budget
            .push(ACCOUNTS, Err("connection reset".into()))
            .push_data(ACCOUNTS, json!({"accounts": []}), 7);

        assert!(budget.get(ACCOUNTS, &Cursor::default()).await.is_err());
        let scripted = budget.get(ACCOUNTS, &Cursor::default()).await.unwrap();
        assert!(scripted.body.contains("\"server_knowledge\":7"));

        let seeded = budget.get(ACCOUNTS, &Cursor::default()).await.unwrap();
        assert!(seeded.body.contains("acct-checking"));

        let caught_up = budget.get(ACCOUNTS, &Cursor::from(1)).await.unwrap();
        assert!(!caught_up.body.contains("acct-checking"));
        assert_eq!(budget.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_unknown_entity_is_not_found() {
        let mut budget = TestBudget::empty();
        let reply = budget.get("budgets", &Cursor::default()).await.unwrap();
        assert_eq!(reply.status, 404);
    }
}
