// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use rangestore::config::Context;
use rangestore::pipeline::{Mutation, UpdateBatch};
use rangestore::range::{RangeSpec, RangeState, END_ROW_SENTINEL};
use rangestore::scanner::ScanSpec;
use rangestore::schema::{AccessGroupSpec, ColumnFamily, Schema, TableIdentifier};
use rangestore::server::RangeServer;
use rangestore::CellFlag;
use std::sync::Arc;

fn schema() -> Schema {
    let mut schema = Schema::new();
    schema.add_access_group(AccessGroupSpec {
        name: "c".into(),
        column_family_ids: vec![],
        in_memory: false,
        blocksize: 0,
    });
    schema.add_column_family(ColumnFamily::new(0, "c", "c")).unwrap();
    schema
}

fn started_server(dir: &std::path::Path) -> (RangeServer, TableIdentifier, RangeSpec) {
    let server = RangeServer::start(Arc::new(Context::new()), dir).unwrap();
    let table = TableIdentifier::new("events", 0);
    let spec = RangeSpec::new(None, END_ROW_SENTINEL.to_vec());
    server.load_range(&table, &spec, &schema(), dir, None, RangeState::Steady, false).unwrap();
    server.acknowledge_load(&[(table.clone(), spec.clone())]);
    (server, table, spec)
}

fn mutation(ts: i64, value: &str, flag: CellFlag) -> Mutation {
    Mutation {
        row: b"a".to_vec(),
        column_family_id: 0,
        qualifier: b"c".to_vec(),
        timestamp: ts,
        revision: ts,
        flag,
        value: value.as_bytes().to_vec(),
    }
}

/// Scenario 2: two versions of the same cell, scanned with
/// `max_versions=1`, yields only the newest.
#[test]
fn max_versions_keeps_only_the_newest() {
    let dir = tempfile::tempdir().unwrap();
    let (server, table, spec) = started_server(dir.path());

    let batch = UpdateBatch {
        table: table.clone(),
        cluster_id: 0,
        mutations: vec![
            mutation(100, "x", CellFlag::Insert),
            mutation(200, "y", CellFlag::Insert),
        ],
        sync: true,
        ignore_unknown_cfs: false,
    };
    server.update(batch).unwrap();

    let scan_spec = ScanSpec { max_versions: Some(1), ..ScanSpec::default() };
    let (_id, cells, eos) = server.create_scanner(&table, &spec, scan_spec, None).unwrap();
    assert!(eos);
    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0].key.timestamp, 200);
    assert_eq!(&cells[0].value[..], b"y");
}

/// Scenario 3: a `DELETE_ROW` at a later timestamp suppresses every
/// earlier version of the row.
#[test]
fn delete_row_suppresses_earlier_versions() {
    let dir = tempfile::tempdir().unwrap();
    let (server, table, spec) = started_server(dir.path());

    let batch = UpdateBatch {
        table: table.clone(),
        cluster_id: 0,
        mutations: vec![
            mutation(100, "x", CellFlag::Insert),
            mutation(200, "y", CellFlag::Insert),
            mutation(300, "", CellFlag::DeleteRow),
        ],
        sync: true,
        ignore_unknown_cfs: false,
    };
    server.update(batch).unwrap();

    let (_id, cells, eos) = server.create_scanner(&table, &spec, ScanSpec::default(), None).unwrap();
    assert!(eos);
    assert!(cells.is_empty());
}
