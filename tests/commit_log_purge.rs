// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use rangestore::commitlog::CommitLog;
use rangestore::compression::CompressionType;
use rangestore::{Cell, CellFlag, CellKey};

/// Scenario 5: three fragments at revisions 10, 20, 30; purging with
/// cutoff 25 and no outstanding references removes the first two and
/// keeps the third.
#[test]
fn purge_removes_fragments_strictly_below_cutoff() {
    let dir = tempfile::tempdir().unwrap();
    let log = CommitLog::create(dir.path(), 1, CompressionType::None).unwrap();

    for revision in [10, 20, 30] {
        let cell = Cell::new(CellKey::new(b"row".to_vec(), 0, b"cq".to_vec(), revision, revision, CellFlag::Insert), b"v".to_vec());
        log.append(&[cell], revision, 0).unwrap();
        log.roll().unwrap();
    }
    assert_eq!(log.fragment_count(), 3);

    let trace = log.purge(25, true, |_| false).unwrap();
    assert_eq!(trace.len(), 2);
    assert_eq!(log.fragment_count(), 1);
}
