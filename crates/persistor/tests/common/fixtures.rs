//! Banking fixtures.
//!
//! Builders set both sides of every relationship, the way application code
//! would, so the graph and the stored foreign keys always agree.

use helios_persistor::core::{Connection, Row};
use helios_persistor::{InstanceId, ObjectGraph, Persistor};
use serde_json::{Value, json};

/// Identities of the seeded bank.
#[derive(Debug, Clone)]
pub struct Bank {
    pub sam: String,
    pub karen: String,
    pub ashling: String,
    pub sams_account: String,
    pub joint_account: String,
}

pub fn create_customer(graph: &mut ObjectGraph, first: &str, middle: &str, last: &str) -> InstanceId {
    let customer = graph.create("Customer").expect("Failed to create customer");
    graph.set(customer, "firstName", first).expect("Failed to set firstName");
    graph.set(customer, "middleName", middle).expect("Failed to set middleName");
    graph.set(customer, "lastName", last).expect("Failed to set lastName");
    customer
}

/// `referrer` referred `referred`.
pub fn refer(graph: &mut ObjectGraph, referrer: InstanceId, referred: InstanceId) {
    graph
        .set_reference(referred, "referredBy", Some(referrer))
        .expect("Failed to set referredBy");
    graph
        .push(referrer, "referrers", referred)
        .expect("Failed to add referrer");
}

/// Adds a `primary` or `secondary` address.
pub fn add_address(
    graph: &mut ObjectGraph,
    customer: InstanceId,
    kind: &str,
    lines: &[&str],
    city: &str,
) -> InstanceId {
    let address = graph.create("Address").expect("Failed to create address");
    graph.set(address, "lines", json!(lines)).expect("Failed to set lines");
    graph.set(address, "city", city).expect("Failed to set city");
    graph.set(address, "state", "MA").expect("Failed to set state");
    graph.set(address, "postalCode", "02110").expect("Failed to set postalCode");
    graph.set(address, "country", "US").expect("Failed to set country");
    graph.set(address, "type", kind).expect("Failed to set type");
    graph
        .set_reference(address, "customer", Some(customer))
        .expect("Failed to set customer");
    graph
        .push(customer, &format!("{}Addresses", kind), address)
        .expect("Failed to add address");
    address
}

pub fn add_returned_mail(graph: &mut ObjectGraph, address: InstanceId, date: &str) -> InstanceId {
    let mail = graph.create("ReturnedMail").expect("Failed to create returned mail");
    graph.set(mail, "date", date).expect("Failed to set date");
    graph
        .set_reference(mail, "address", Some(address))
        .expect("Failed to set address");
    graph
        .push(address, "returnedMail", mail)
        .expect("Failed to add returned mail");
    mail
}

/// Opens an account with `customer` as its primary holder.
pub fn create_account(
    graph: &mut ObjectGraph,
    number: i64,
    title: &[&str],
    customer: InstanceId,
    address: InstanceId,
) -> InstanceId {
    let account = graph.create("Account").expect("Failed to create account");
    graph.set(account, "number", number).expect("Failed to set number");
    graph.set(account, "title", json!(title)).expect("Failed to set title");
    graph
        .set_reference(account, "address", Some(address))
        .expect("Failed to set address");
    add_role(graph, account, customer, "primary");
    account
}

pub fn add_role(graph: &mut ObjectGraph, account: InstanceId, customer: InstanceId, relationship: &str) -> InstanceId {
    let role = graph.create("Role").expect("Failed to create role");
    graph
        .set(role, "relationship", relationship)
        .expect("Failed to set relationship");
    graph
        .set_reference(role, "customer", Some(customer))
        .expect("Failed to set customer");
    graph
        .set_reference(role, "account", Some(account))
        .expect("Failed to set account");
    graph.push(customer, "roles", role).expect("Failed to add role");
    graph.push(account, "roles", role).expect("Failed to add role");
    role
}

fn add_transaction(graph: &mut ObjectGraph, template: &str, account: InstanceId, amount: i64) -> InstanceId {
    let transaction = graph.create(template).expect("Failed to create transaction");
    graph.set(transaction, "amount", amount).expect("Failed to set amount");
    graph
        .set(transaction, "type", template.to_lowercase())
        .expect("Failed to set type");
    graph
        .set_reference(transaction, "account", Some(account))
        .expect("Failed to set account");
    graph
        .push(account, "transactions", transaction)
        .expect("Failed to add transaction");
    transaction
}

pub fn credit(graph: &mut ObjectGraph, account: InstanceId, amount: i64) -> InstanceId {
    add_transaction(graph, "Credit", account, amount)
}

pub fn debit(graph: &mut ObjectGraph, account: InstanceId, amount: i64) -> InstanceId {
    add_transaction(graph, "Debit", account, amount)
}

/// Moves `amount` from `from` into `to`.
pub fn transfer(graph: &mut ObjectGraph, from: InstanceId, to: InstanceId, amount: i64) -> InstanceId {
    let xfer = add_transaction(graph, "Xfer", to, amount);
    graph
        .set_reference(xfer, "fromAccount", Some(from))
        .expect("Failed to set fromAccount");
    graph
        .push(from, "fromAccountTransactions", xfer)
        .expect("Failed to add transfer");
    xfer
}

fn amount(graph: &ObjectGraph, transaction: InstanceId) -> f64 {
    graph
        .get(transaction, "amount")
        .expect("Failed to read amount")
        .as_f64()
        .unwrap_or_default()
}

/// Credits and incoming transfers minus debits and outgoing transfers.
///
/// Only counts what is resolved in `graph`.
pub fn balance(graph: &ObjectGraph, account: InstanceId) -> f64 {
    let booked: f64 = graph
        .collection(account, "transactions")
        .iter()
        .map(|t| {
            let template = graph.instance(*t).expect("Failed to read transaction").template();
            if template == "Debit" {
                -amount(graph, *t)
            } else {
                amount(graph, *t)
            }
        })
        .sum();
    let sent: f64 = graph
        .collection(account, "fromAccountTransactions")
        .iter()
        .map(|t| amount(graph, *t))
        .sum();
    booked - sent
}

fn identity(graph: &ObjectGraph, id: InstanceId) -> String {
    graph
        .instance(id)
        .expect("Failed to read instance")
        .id()
        .expect("Instance was not saved")
        .to_string()
}

/// Seeds three customers, two accounts and six transactions.
///
/// Sam's account ends at a balance of 100, the joint account at 125.
pub async fn create_bank(persistor: &Persistor) -> Bank {
    let mut graph = persistor.graph();

    let sam = create_customer(&mut graph, "Sam", "M", "Elsamman");
    let karen = create_customer(&mut graph, "Karen", "", "Burke");
    let ashling = create_customer(&mut graph, "Ashling", "", "Burke");
    refer(&mut graph, sam, karen);
    refer(&mut graph, sam, ashling);

    let sams_home = add_address(&mut graph, sam, "primary", &["500 East Street"], "Boston");
    add_address(&mut graph, sam, "secondary", &["Box 30"], "Boston");
    add_returned_mail(&mut graph, sams_home, "2024-01-15");
    let karens_home = add_address(&mut graph, karen, "primary", &["2 Main Street", "Apt 4"], "Rye");
    add_address(&mut graph, ashling, "primary", &["2 Main Street", "Apt 4"], "Rye");

    let sams_account = create_account(&mut graph, 123412341234, &["Sam Elsamman"], sam, sams_home);
    let joint_account = create_account(
        &mut graph,
        123412341235,
        &["Karen Burke", "Sam Elsamman"],
        karen,
        karens_home,
    );
    add_role(&mut graph, joint_account, sam, "joint");

    credit(&mut graph, sams_account, 100);
    debit(&mut graph, sams_account, 50);
    credit(&mut graph, joint_account, 200);
    transfer(&mut graph, joint_account, sams_account, 100);
    transfer(&mut graph, sams_account, joint_account, 50);
    debit(&mut graph, joint_account, 25);

    persistor
        .save(&mut graph, &[sam, karen, ashling])
        .await
        .expect("Failed to save bank");

    Bank {
        sam: identity(&graph, sam),
        karen: identity(&graph, karen),
        ashling: identity(&graph, ashling),
        sams_account: identity(&graph, sams_account),
        joint_account: identity(&graph, joint_account),
    }
}

/// Writes a new version of a stored row behind the engine's back.
pub async fn bump_version(persistor: &Persistor, template: &str, id: &str) {
    let target = persistor
        .table_name(template)
        .expect("Failed to resolve table")
        .to_string();
    let mut conn = persistor.backend().acquire().await.expect("Failed to acquire connection");
    let current = conn
        .read_version(&target, id)
        .await
        .expect("Failed to read version")
        .expect("Row does not exist");
    let mut row = Row::new();
    row.insert("__version__".to_string(), Value::from(current + 1));
    let affected = conn
        .update(&target, id, row, current)
        .await
        .expect("Failed to bump version");
    assert_eq!(affected, 1);
}
