// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use rangestore::config::Context;
use rangestore::pipeline::{Mutation, UpdateBatch};
use rangestore::range::{RangeSpec, RangeState, END_ROW_SENTINEL};
use rangestore::scanner::ScanSpec;
use rangestore::schema::{AccessGroupSpec, ColumnFamily, Schema, TableIdentifier};
use rangestore::server::RangeServer;
use rangestore::AUTO_ASSIGN;
use std::sync::Arc;

fn schema() -> Schema {
    let mut schema = Schema::new();
    schema.add_access_group(AccessGroupSpec {
        name: "data".into(),
        column_family_ids: vec![],
        in_memory: false,
        blocksize: 0,
    });
    schema.add_column_family(ColumnFamily::new(0, "data", "data")).unwrap();
    schema
}

/// Scenario 4: 100 keys `row000000..row000099`, a 30 KiB split-size
/// budget, one split landing on the median key, with both halves
/// scanning to disjoint, size-summing halves of the original 100 rows.
#[test]
fn split_lands_on_the_median_row_and_halves_are_disjoint() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = Context::new();
    ctx.range_split_size = 30 * 1024;
    let server = RangeServer::start(Arc::new(ctx), dir.path()).unwrap();

    let table = TableIdentifier::new("events", 0);
    let spec = RangeSpec::new(None, END_ROW_SENTINEL.to_vec());
    server.load_range(&table, &spec, &schema(), dir.path(), None, RangeState::Steady, false).unwrap();
    server.acknowledge_load(&[(table.clone(), spec.clone())]);

    let mutations = (0..100)
        .map(|i| Mutation {
            row: format!("row{i:06}").into_bytes(),
            column_family_id: 0,
            qualifier: b"data".to_vec(),
            timestamp: AUTO_ASSIGN,
            revision: AUTO_ASSIGN,
            flag: rangestore::CellFlag::Insert,
            value: vec![b'x'; 1024],
        })
        .collect();
    let outcome = server
        .update(UpdateBatch { table: table.clone(), cluster_id: 0, mutations, sync: true, ignore_unknown_cfs: false })
        .unwrap();
    assert!(outcome.rejected.is_empty());

    let (low_spec, high_spec) = server.split_range(&table, &spec, &schema(), dir.path()).unwrap();
    assert_eq!(low_spec.end_row, b"row000050".to_vec());
    assert_eq!(high_spec.start_row, Some(b"row000050".to_vec()));

    let (_id, low_cells, low_eos) = server.create_scanner(&table, &low_spec, ScanSpec::default(), None).unwrap();
    let (_id, high_cells, high_eos) = server.create_scanner(&table, &high_spec, ScanSpec::default(), None).unwrap();
    assert!(low_eos && high_eos);
    assert_eq!(low_cells.len(), 51);
    assert_eq!(high_cells.len(), 49);

    let mut rows: Vec<_> = low_cells.iter().chain(high_cells.iter()).map(|c| c.key.row.to_vec()).collect();
    rows.sort();
    rows.dedup();
    assert_eq!(rows.len(), 100);
}
