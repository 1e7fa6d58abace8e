mod support;

use common::time::NANOS_PER_HOUR;
use common::FieldValue;
use meridian_core::{parse_query, LocalBroker, Privilege};
use tempfile::TempDir;

use crate::support::*;

#[test]
fn ddl_and_select_round_trip_through_the_dispatcher() {
    let tmp = TempDir::new().unwrap();
    let broker = LocalBroker::new();
    let node = open_node(tmp.path().join("node1"), &broker, 1);

    let results = node.execute_query(
        parse_query(
            "CREATE DATABASE db; \
             CREATE RETENTION POLICY rp ON db DURATION 1h REPLICATION 1 DEFAULT",
        )
        .unwrap(),
        "",
        None,
    );
    assert!(results.error().is_none(), "{:?}", results.error());

    write_and_sync(&node, "db", "rp", &[
        point("cpu", &[("host", "a")], Y2K + 10, FieldValue::Float(1.0)),
        point("cpu", &[("host", "a")], Y2K + 20, FieldValue::Float(3.0)),
        point("cpu", &[("host", "b")], Y2K + 30, FieldValue::Float(5.0)),
    ]);

    let results = node.execute_query(
        parse_query("SELECT value FROM cpu WHERE host = 'a'").unwrap(),
        "db",
        None,
    );
    assert!(results.error().is_none(), "{:?}", results.error());
    let rows = &results.results[0].rows;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].name, "cpu");
    assert_eq!(rows[0].values.len(), 2);

    let results = node.execute_query(
        parse_query(&format!(
            "SELECT mean(value) FROM cpu WHERE time >= {} AND time < {} GROUP BY time(1h)",
            Y2K,
            Y2K + NANOS_PER_HOUR
        ))
        .unwrap(),
        "db",
        None,
    );
    assert!(results.error().is_none());
    let rows = &results.results[0].rows;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].values[0][1], Some(FieldValue::Float(3.0)));
}

#[test]
fn show_statements_reflect_the_catalog() {
    let tmp = TempDir::new().unwrap();
    let broker = LocalBroker::new();
    let node = open_node(tmp.path().join("node1"), &broker, 1);

    create_database_with_policy(&node, "db", "rp", NANOS_PER_HOUR, 1);
    write_and_sync(&node, "db", "rp", &[
        point("cpu", &[("host", "a")], Y2K, FieldValue::Float(1.0)),
        point("mem", &[("host", "b")], Y2K, FieldValue::Float(1.0)),
    ]);

    let results = node.execute_query(parse_query("SHOW DATABASES").unwrap(), "", None);
    assert_eq!(
        results.results[0].rows[0].values,
        vec![vec![Some(FieldValue::String("db".into()))]]
    );

    let results = node.execute_query(parse_query("SHOW MEASUREMENTS").unwrap(), "db", None);
    let names: Vec<_> = results.results[0].rows[0]
        .values
        .iter()
        .map(|line| line[0].clone())
        .collect();
    assert_eq!(
        names,
        vec![
            Some(FieldValue::String("cpu".into())),
            Some(FieldValue::String("mem".into()))
        ]
    );

    let results = node.execute_query(
        parse_query("SHOW TAG VALUES FROM cpu WITH KEY = host").unwrap(),
        "db",
        None,
    );
    assert_eq!(
        results.results[0].rows[0].values,
        vec![vec![Some(FieldValue::String("a".into()))]]
    );

    let results = node.execute_query(
        parse_query("SHOW FIELD KEYS FROM cpu").unwrap(),
        "db",
        None,
    );
    assert_eq!(
        results.results[0].rows[0].values,
        vec![vec![Some(FieldValue::String("value".into()))]]
    );
}

#[test]
fn later_statements_are_not_executed_after_a_failure() {
    let tmp = TempDir::new().unwrap();
    let broker = LocalBroker::new();
    let node = open_node(tmp.path().join("node1"), &broker, 1);

    let results = node.execute_query(
        parse_query("CREATE DATABASE db; CREATE DATABASE db; CREATE DATABASE other").unwrap(),
        "",
        None,
    );
    assert_eq!(results.results.len(), 3);
    assert!(results.results[0].error.is_none());
    assert_eq!(results.results[1].error.as_deref(), Some("database exists"));
    assert_eq!(
        results.results[2].error.as_deref(),
        Some("statement not executed")
    );
    // The third statement never ran.
    assert_eq!(node.databases().unwrap(), vec!["db".to_string()]);
}

#[test]
fn non_admin_without_read_privilege_is_denied() {
    let tmp = TempDir::new().unwrap();
    let broker = LocalBroker::new();
    let node = open_node(tmp.path().join("node1"), &broker, 1);

    create_database_with_policy(&node, "db", "rp", NANOS_PER_HOUR, 1);
    node.create_user("bob", "pw", false).unwrap();
    node.set_authentication_enabled(true);

    let bob = node.user("bob").unwrap().unwrap();
    let results = node.execute_query(
        parse_query("SELECT value FROM cpu").unwrap(),
        "db",
        Some(&bob),
    );
    let error = results.error().expect("authorization should fail");
    assert!(error.contains("not authorized"), "{error}");
    // Nothing was planned or executed.
    assert!(results.results.is_empty());
}

#[test]
fn grants_allow_scoped_reads_and_revokes_remove_them() {
    let tmp = TempDir::new().unwrap();
    let broker = LocalBroker::new();
    let node = open_node(tmp.path().join("node1"), &broker, 1);

    create_database_with_policy(&node, "db", "rp", NANOS_PER_HOUR, 1);
    write_and_sync(&node, "db", "rp", &[
        point("cpu", &[], Y2K, FieldValue::Float(1.0)),
    ]);
    node.create_user("bob", "pw", false).unwrap();
    node.set_privilege(Privilege::Read, "bob", "db").unwrap();
    node.set_authentication_enabled(true);

    let bob = node.user("bob").unwrap().unwrap();
    let results = node.execute_query(
        parse_query("SELECT value FROM cpu").unwrap(),
        "db",
        Some(&bob),
    );
    assert!(results.error().is_none(), "{:?}", results.error());

    node.set_privilege(Privilege::None, "bob", "db").unwrap();
    let bob = node.user("bob").unwrap().unwrap();
    let results = node.execute_query(
        parse_query("SELECT value FROM cpu").unwrap(),
        "db",
        Some(&bob),
    );
    assert!(results.error().is_some());
}

#[test]
fn authentication_verifies_bcrypt_hashes() {
    let tmp = TempDir::new().unwrap();
    let broker = LocalBroker::new();
    let node = open_node(tmp.path().join("node1"), &broker, 1);

    node.create_user("ada", "secret", true).unwrap();
    node.set_authentication_enabled(true);

    assert!(node.authenticate("ada", "secret").unwrap().is_some());
    assert!(node.authenticate("ada", "wrong").is_err());
    assert!(node.authenticate("ghost", "pw").is_err());

    node.set_authentication_enabled(false);
    // Unknown user with authentication disabled is allowed through.
    assert!(node.authenticate("ghost", "pw").unwrap().is_none());
}
