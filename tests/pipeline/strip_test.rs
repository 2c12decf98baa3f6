use relink::catalog::Catalog;
use relink::config::StagingSettings;
use relink::pipeline::{self, PipelineOptions, StripOutcome};
use relink::RelinkError;
use rusqlite::Connection;
use std::collections::BTreeMap;

fn materialized() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = OFF;
        CREATE TABLE uids (uid TEXT PRIMARY KEY NOT NULL, table_name TEXT);
        CREATE TABLE relations (table_name TEXT, field_name TEXT, foreign_table TEXT);
        CREATE TABLE mip (uid TEXT PRIMARY KEY NOT NULL REFERENCES uids (uid), label TEXT);
        CREATE TABLE experiment (
            uid TEXT PRIMARY KEY NOT NULL REFERENCES uids (uid),
            mip TEXT REFERENCES uids (uid),
            label TEXT
        );
        CREATE TABLE requestLink (
            uid TEXT PRIMARY KEY NOT NULL REFERENCES uids (uid),
            mip TEXT REFERENCES uids (uid),
            experiment TEXT REFERENCES uids (uid)
        );
        INSERT INTO uids VALUES
            ('m1', 'mip'), ('e1', 'experiment'), ('r1', 'requestLink');
        INSERT INTO mip VALUES ('m1', 'CMIP');
        INSERT INTO experiment VALUES ('e1', 'm1', 'historical');
        INSERT INTO requestLink VALUES ('r1', 'm1', 'e1');
        INSERT INTO relations VALUES
            ('experiment', 'mip', 'mip'),
            ('requestLink', 'mip', 'mip'),
            ('requestLink', 'experiment', 'experiment');
        "#,
    )
    .unwrap();
    conn
}

/// (table, column) -> referenced table, for every foreign key in the database.
fn targets(conn: &Connection) -> BTreeMap<(String, String), String> {
    let catalog = Catalog::new(conn);
    let mut map = BTreeMap::new();
    for table in catalog.list_tables().unwrap() {
        for fk in catalog.foreign_keys(&table).unwrap() {
            map.insert((table.clone(), fk.from), fk.table);
        }
    }
    map
}

#[test]
fn test_strip_keeps_typed_references() {
    let mut conn = materialized();
    let staging = StagingSettings::default();
    pipeline::run(&mut conn, &staging, &PipelineOptions::default()).unwrap();

    let before: BTreeMap<_, _> = targets(&conn)
        .into_iter()
        .filter(|(_, target)| target != "uids")
        .collect();
    assert_eq!(before.len(), 3);

    let report = pipeline::strip(&mut conn, &staging, false).unwrap();

    assert!(report.dropped_identifier_table);
    assert!(!Catalog::new(&conn).table_exists("uids").unwrap());
    assert_eq!(targets(&conn), before);

    let label: String = conn
        .query_row("SELECT label FROM experiment WHERE uid = 'e1'", [], |r| r.get(0))
        .unwrap();
    assert_eq!(label, "historical");
}

#[test]
fn test_run_with_strip() {
    let mut conn = materialized();
    let options = PipelineOptions {
        strip: true,
        ..PipelineOptions::default()
    };

    let report = pipeline::run(&mut conn, &StagingSettings::default(), &options).unwrap();

    let StripOutcome::Completed(strip) = &report.strip else {
        panic!("expected stripping to run, got {:?}", report.strip);
    };
    assert_eq!(strip.rewritten, vec!["experiment", "mip", "requestLink"]);
    assert!(targets(&conn).values().all(|t| t != "uids"));
    assert!(report.to_string().contains("identifier table dropped"));
}

#[test]
fn test_strip_blocked_by_pending_claims() {
    let mut conn = materialized();
    conn.execute(
        "INSERT INTO relations VALUES ('experiment', 'missing', 'mip')",
        [],
    )
    .unwrap();
    let staging = StagingSettings::default();
    let options = PipelineOptions {
        strip: true,
        ..PipelineOptions::default()
    };

    let report = pipeline::run(&mut conn, &staging, &options).unwrap();
    assert_eq!(report.strip, StripOutcome::Blocked { pending: 1 });
    assert!(Catalog::new(&conn).table_exists("uids").unwrap());

    let err = pipeline::strip(&mut conn, &staging, false).unwrap_err();
    assert!(matches!(err, RelinkError::StripBlocked(1)));

    let forced = pipeline::strip(&mut conn, &staging, true).unwrap();
    assert!(forced.dropped_identifier_table);
}

#[test]
fn test_strip_twice() {
    let mut conn = materialized();
    let staging = StagingSettings::default();
    pipeline::run(&mut conn, &staging, &PipelineOptions::default()).unwrap();
    pipeline::strip(&mut conn, &staging, false).unwrap();

    let again = pipeline::strip(&mut conn, &staging, false).unwrap();
    assert!(!again.dropped_identifier_table);
    assert!(again.rewritten.is_empty());
}
