use relink::catalog::Catalog;
use relink::config::StagingSettings;
use relink::discover::{ConflictKind, UnpopulatedPolicy};
use relink::pipeline::{self, PipelineOptions, StripOutcome};
use relink::worklist::{RelationClaim, Worklist, WorklistOutcome};
use relink::RelinkError;
use rusqlite::Connection;

fn database(sql: &str) -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch("PRAGMA foreign_keys = OFF;").unwrap();
    conn.execute_batch(
        r#"
        CREATE TABLE uids (uid TEXT PRIMARY KEY NOT NULL, table_name TEXT);
        CREATE TABLE relations (table_name TEXT, field_name TEXT, foreign_table TEXT);
        "#,
    )
    .unwrap();
    conn.execute_batch(sql).unwrap();
    conn
}

fn no_strip() -> PipelineOptions {
    PipelineOptions::default()
}

fn schema_sql(conn: &Connection) -> Vec<(String, String)> {
    let mut stmt = conn
        .prepare("SELECT name, sql FROM sqlite_master WHERE type = 'table' ORDER BY name")
        .unwrap();
    stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

fn references(conn: &Connection, table: &str, column: &str) -> Vec<String> {
    Catalog::new(conn)
        .foreign_keys(table)
        .unwrap()
        .into_iter()
        .filter(|fk| fk.from == column)
        .map(|fk| fk.table)
        .collect()
}

// ============================================================================
// End-to-end
// ============================================================================

#[test]
fn test_two_table_scenario() {
    let mut conn = database(
        r#"
        CREATE TABLE B (uid TEXT PRIMARY KEY NOT NULL REFERENCES uids (uid));
        CREATE TABLE A (uid TEXT PRIMARY KEY NOT NULL REFERENCES uids (uid), ref TEXT);
        INSERT INTO uids VALUES ('b1', 'B'), ('a1', 'A');
        INSERT INTO B VALUES ('b1');
        INSERT INTO A VALUES ('a1', 'b1');
        INSERT INTO relations VALUES ('A', 'ref', 'B');
        "#,
    );

    let report = pipeline::run(&mut conn, &StagingSettings::default(), &no_strip()).unwrap();

    assert_eq!(references(&conn, "A", "ref"), vec!["B"]);
    assert_eq!(references(&conn, "A", "uid"), vec!["uids"]);
    assert_eq!(report.integrity.worklist, WorklistOutcome::Dropped);
    assert!(report.integrity.violations.is_empty());
    assert!(report.is_clean());
    assert_eq!(report.strip, StripOutcome::NotRequested);
    assert!(!Catalog::new(&conn).table_exists("relations").unwrap());
}

#[test]
fn test_report_display() {
    let mut conn = database(
        r#"
        CREATE TABLE B (uid TEXT PRIMARY KEY NOT NULL);
        CREATE TABLE A (uid TEXT PRIMARY KEY NOT NULL, ref TEXT);
        INSERT INTO uids VALUES ('b1', 'B'), ('a1', 'A');
        INSERT INTO B VALUES ('b1');
        INSERT INTO A VALUES ('a1', 'b1');
        INSERT INTO relations VALUES ('A', 'ref', 'B');
        "#,
    );

    let report = pipeline::run(&mut conn, &StagingSettings::default(), &no_strip()).unwrap();
    let text = report.to_string();

    assert!(text.contains("relations: 1 confirmed, 0 conflicts"));
    assert!(text.contains("foreign key violations: 0"));
    assert!(text.contains("strip: skipped"));

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["integrity"]["worklist"]["status"], "dropped");
    assert_eq!(json["strip"]["status"], "not_requested");
}

// ============================================================================
// Evidence
// ============================================================================

#[test]
fn test_ambiguous_relation_is_preserved() {
    let mut conn = database(
        r#"
        CREATE TABLE var (uid TEXT PRIMARY KEY NOT NULL);
        CREATE TABLE CMORvar (uid TEXT PRIMARY KEY NOT NULL);
        CREATE TABLE link (uid TEXT PRIMARY KEY NOT NULL, target TEXT REFERENCES uids (uid));
        INSERT INTO uids VALUES ('v1', 'var'), ('c1', 'CMORvar');
        INSERT INTO var VALUES ('v1');
        INSERT INTO CMORvar VALUES ('c1');
        INSERT INTO link VALUES ('l1', 'v1'), ('l2', 'c1');
        INSERT INTO relations VALUES ('link', 'target', 'var');
        "#,
    );

    let report = pipeline::run(&mut conn, &StagingSettings::default(), &no_strip()).unwrap();

    let discovery = report.discovery.as_ref().unwrap();
    assert_eq!(discovery.conflicts.len(), 1);
    assert_eq!(discovery.conflicts[0].kind, ConflictKind::Ambiguous);
    assert_eq!(discovery.conflicts[0].observed, vec!["CMORvar", "var"]);

    assert!(references(&conn, "link", "target").is_empty());
    assert_eq!(
        report.integrity.worklist,
        WorklistOutcome::Pending(vec![RelationClaim::new("link", "target", "var")])
    );
    let staged = Worklist::load(&conn, "relations").unwrap().unwrap();
    assert_eq!(staged.len(), 1);
    assert!(!report.is_clean());
}

#[test]
fn test_contradicted_relation_is_preserved() {
    let mut conn = database(
        r#"
        CREATE TABLE var (uid TEXT PRIMARY KEY NOT NULL);
        CREATE TABLE mip (uid TEXT PRIMARY KEY NOT NULL);
        CREATE TABLE link (uid TEXT PRIMARY KEY NOT NULL, target TEXT);
        INSERT INTO uids VALUES ('m1', 'mip');
        INSERT INTO mip VALUES ('m1');
        INSERT INTO link VALUES ('l1', 'm1');
        INSERT INTO relations VALUES ('link', 'target', 'var');
        "#,
    );

    let report = pipeline::run(&mut conn, &StagingSettings::default(), &no_strip()).unwrap();

    let conflict = &report.discovery.as_ref().unwrap().conflicts[0];
    assert_eq!(conflict.kind, ConflictKind::Contradicted);
    assert_eq!(conflict.observed, vec!["mip"]);
    assert!(references(&conn, "link", "target").is_empty());
    assert_eq!(report.integrity.worklist.pending(), 1);
}

#[test]
fn test_unpopulated_relation_accepts_hint() {
    let mut conn = database(
        r#"
        CREATE TABLE var (uid TEXT PRIMARY KEY NOT NULL);
        CREATE TABLE link (uid TEXT PRIMARY KEY NOT NULL, target TEXT);
        INSERT INTO link VALUES ('l1', NULL), ('l2', NULL);
        INSERT INTO relations VALUES ('link', 'target', 'var');
        "#,
    );

    let report = pipeline::run(&mut conn, &StagingSettings::default(), &no_strip()).unwrap();

    assert_eq!(references(&conn, "link", "target"), vec!["var"]);
    assert_eq!(report.integrity.worklist, WorklistOutcome::Dropped);
}

#[test]
fn test_unpopulated_relation_deferred() {
    let mut conn = database(
        r#"
        CREATE TABLE var (uid TEXT PRIMARY KEY NOT NULL);
        CREATE TABLE link (uid TEXT PRIMARY KEY NOT NULL, target TEXT);
        INSERT INTO link VALUES ('l1', NULL);
        INSERT INTO relations VALUES ('link', 'target', 'var');
        "#,
    );
    let options = PipelineOptions {
        policy: UnpopulatedPolicy::Defer,
        ..PipelineOptions::default()
    };

    let report = pipeline::run(&mut conn, &StagingSettings::default(), &options).unwrap();

    assert!(references(&conn, "link", "target").is_empty());
    let conflict = &report.discovery.as_ref().unwrap().conflicts[0];
    assert_eq!(conflict.kind, ConflictKind::Unpopulated);
    assert_eq!(report.integrity.worklist.pending(), 1);
}

// ============================================================================
// Preservation and idempotence
// ============================================================================

#[test]
fn test_rows_and_values_preserved_by_name() {
    let mut conn = database(
        r#"
        CREATE TABLE var (uid TEXT PRIMARY KEY NOT NULL, label TEXT);
        CREATE TABLE CMORvar (
            uid TEXT PRIMARY KEY NOT NULL REFERENCES uids (uid),
            label TEXT,
            vid TEXT REFERENCES uids (uid),
            priority INTEGER NOT NULL DEFAULT 1,
            weight REAL,
            blob BLOB
        );
        INSERT INTO uids VALUES ('v1', 'var'), ('v2', 'var');
        INSERT INTO var VALUES ('v1', 'tas'), ('v2', 'pr');
        INSERT INTO CMORvar VALUES ('c1', 'tas', 'v1', 1, 0.5, x'00ff');
        INSERT INTO CMORvar VALUES ('c2', 'pr', 'v2', 3, NULL, NULL);
        INSERT INTO CMORvar VALUES ('c3', NULL, NULL, 2, 1.25, x'');
        INSERT INTO relations VALUES ('CMORvar', 'vid', 'var');
        "#,
    );

    let query = "SELECT uid, label, vid, priority, weight, blob FROM CMORvar ORDER BY uid";
    type Row = (
        String,
        Option<String>,
        Option<String>,
        i64,
        Option<f64>,
        Option<Vec<u8>>,
    );
    let read = |conn: &Connection| -> Vec<Row> {
        let mut stmt = conn.prepare(query).unwrap();
        stmt.query_map([], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
        })
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
    };

    let before = read(&conn);
    pipeline::run(&mut conn, &StagingSettings::default(), &no_strip()).unwrap();
    let after = read(&conn);

    assert_eq!(before.len(), 3);
    assert_eq!(before, after);
    assert_eq!(references(&conn, "CMORvar", "vid"), vec!["var"]);

    let schema = Catalog::new(&conn).table("CMORvar").unwrap();
    let priority = schema.column("priority").unwrap();
    assert!(priority.not_null);
    assert_eq!(priority.default.as_deref(), Some("1"));
}

#[test]
fn test_second_run_changes_nothing() {
    let mut conn = database(
        r#"
        CREATE TABLE var (uid TEXT PRIMARY KEY NOT NULL REFERENCES uids (uid));
        CREATE TABLE CMORvar (uid TEXT PRIMARY KEY NOT NULL REFERENCES uids (uid));
        CREATE TABLE link (
            uid TEXT PRIMARY KEY NOT NULL REFERENCES uids (uid),
            vid TEXT,
            either TEXT
        );
        INSERT INTO uids VALUES ('v1', 'var'), ('c1', 'CMORvar'), ('l1', 'link'), ('l2', 'link');
        INSERT INTO var VALUES ('v1');
        INSERT INTO CMORvar VALUES ('c1');
        INSERT INTO link VALUES ('l1', 'v1', 'v1'), ('l2', 'v1', 'c1');
        INSERT INTO relations VALUES ('link', 'vid', 'var');
        INSERT INTO relations VALUES ('link', 'either', 'var');
        "#,
    );
    let staging = StagingSettings::default();

    let first = pipeline::run(&mut conn, &staging, &no_strip()).unwrap();
    let schema_after_first = schema_sql(&conn);
    let second = pipeline::run(&mut conn, &staging, &no_strip()).unwrap();

    assert_eq!(schema_after_first, schema_sql(&conn));
    assert_eq!(first.integrity.worklist, second.integrity.worklist);
    assert_eq!(second.materialized.unwrap().rewritten, Vec::<String>::new());
    assert!(second.recovered.is_empty());
}

#[test]
fn test_without_worklist() {
    let mut conn = database("CREATE TABLE var (uid TEXT PRIMARY KEY NOT NULL);");
    conn.execute_batch("DROP TABLE relations").unwrap();

    let report = pipeline::run(&mut conn, &StagingSettings::default(), &no_strip()).unwrap();

    assert!(report.discovery.is_none());
    assert!(report.materialized.is_none());
    assert_eq!(report.integrity.worklist, WorklistOutcome::Absent);
    assert!(report.to_string().contains("no worklist"));
}

#[test]
fn test_recovers_interrupted_rewrite() {
    let mut conn = database(
        r#"
        CREATE TABLE var (uid TEXT PRIMARY KEY NOT NULL);
        CREATE TABLE link (uid TEXT PRIMARY KEY NOT NULL, vid TEXT);
        CREATE TABLE new_link (uid TEXT PRIMARY KEY NOT NULL, vid TEXT);
        INSERT INTO uids VALUES ('v1', 'var');
        INSERT INTO var VALUES ('v1');
        INSERT INTO link VALUES ('l1', 'v1');
        INSERT INTO relations VALUES ('link', 'vid', 'var');
        "#,
    );

    let report = pipeline::run(&mut conn, &StagingSettings::default(), &no_strip()).unwrap();

    assert_eq!(report.recovered, vec!["new_link"]);
    assert_eq!(references(&conn, "link", "vid"), vec!["var"]);
}

#[test]
fn test_recovery_leaves_unrelated_populated_table() {
    let mut conn = database(
        r#"
        CREATE TABLE thing (uid TEXT, label TEXT);
        CREATE TABLE new_thing (uid TEXT, label TEXT);
        INSERT INTO new_thing VALUES ('n1', 'real data');
        "#,
    );

    let report = pipeline::run(&mut conn, &StagingSettings::default(), &no_strip()).unwrap();

    assert!(report.recovered.is_empty());
    let label: String = conn
        .query_row("SELECT label FROM new_thing WHERE uid = 'n1'", [], |r| r.get(0))
        .unwrap();
    assert_eq!(label, "real data");
}

#[test]
fn test_conflicting_hints_are_stable_across_runs() {
    let mut conn = database(
        r#"
        CREATE TABLE B (uid TEXT PRIMARY KEY NOT NULL REFERENCES uids (uid));
        CREATE TABLE C (uid TEXT PRIMARY KEY NOT NULL REFERENCES uids (uid));
        CREATE TABLE A (uid TEXT PRIMARY KEY NOT NULL REFERENCES uids (uid), ref TEXT);
        INSERT INTO uids VALUES ('a1', 'A');
        INSERT INTO A VALUES ('a1', NULL);
        INSERT INTO relations VALUES ('A', 'ref', 'B'), ('A', 'ref', 'C');
        "#,
    );
    let staging = StagingSettings::default();

    let first = pipeline::run(&mut conn, &staging, &no_strip()).unwrap();
    let schema_after_first = schema_sql(&conn);
    let second = pipeline::run(&mut conn, &staging, &no_strip()).unwrap();

    assert!(references(&conn, "A", "ref").is_empty());
    assert_eq!(schema_after_first, schema_sql(&conn));
    let discovery = first.discovery.as_ref().unwrap();
    assert_eq!(discovery.conflicts.len(), 2);
    assert!(discovery
        .conflicts
        .iter()
        .all(|c| c.kind == ConflictKind::ConflictingHints));
    assert_eq!(second.integrity.worklist.pending(), 2);
    assert!(!first.is_clean());
}

#[test]
fn test_run_with_enforcement_on() {
    let mut conn = database(
        r#"
        CREATE TABLE B (uid TEXT PRIMARY KEY NOT NULL REFERENCES uids (uid));
        CREATE TABLE A (uid TEXT PRIMARY KEY NOT NULL REFERENCES uids (uid), ref TEXT);
        CREATE TABLE note (id INTEGER PRIMARY KEY, a TEXT REFERENCES A (uid) ON DELETE CASCADE);
        INSERT INTO uids VALUES ('b1', 'B'), ('a1', 'A');
        INSERT INTO B VALUES ('b1');
        INSERT INTO A VALUES ('a1', 'b1');
        INSERT INTO note (a) VALUES ('a1');
        INSERT INTO relations VALUES ('A', 'ref', 'B');
        "#,
    );
    conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();

    let report = pipeline::run(&mut conn, &StagingSettings::default(), &no_strip()).unwrap();

    assert_eq!(references(&conn, "A", "ref"), vec!["B"]);
    assert_eq!(Catalog::new(&conn).row_count("note").unwrap(), 1);
    assert!(report.integrity.violations.is_empty());
    let enforced: i64 = conn
        .query_row("PRAGMA foreign_keys", [], |r| r.get(0))
        .unwrap();
    assert_eq!(enforced, 1);
}

#[test]
fn test_run_refuses_enforcement_inside_transaction() {
    let mut conn = database(
        r#"
        CREATE TABLE A (uid TEXT PRIMARY KEY NOT NULL REFERENCES uids (uid), ref TEXT);
        INSERT INTO relations VALUES ('A', 'ref', 'A');
        "#,
    );
    conn.execute_batch("PRAGMA foreign_keys = ON; BEGIN;").unwrap();

    let err = pipeline::run(&mut conn, &StagingSettings::default(), &no_strip()).unwrap_err();

    assert!(matches!(err, RelinkError::ForeignKeysEnforced));
    conn.execute_batch("ROLLBACK;").unwrap();
}

// ============================================================================
// Files
// ============================================================================

#[test]
fn test_open_missing_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dreq.sqlite");

    let err = pipeline::open(&path).unwrap_err();

    assert!(matches!(err, RelinkError::DatabaseNotFound(_)));
    assert!(!path.exists());
}

#[test]
fn test_run_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dreq.sqlite");
    {
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE uids (uid TEXT PRIMARY KEY NOT NULL, table_name TEXT);
            CREATE TABLE relations (table_name TEXT, field_name TEXT, foreign_table TEXT);
            CREATE TABLE B (uid TEXT PRIMARY KEY NOT NULL REFERENCES uids (uid));
            CREATE TABLE A (uid TEXT PRIMARY KEY NOT NULL REFERENCES uids (uid), ref TEXT);
            INSERT INTO uids VALUES ('b1', 'B'), ('a1', 'A');
            INSERT INTO B VALUES ('b1');
            INSERT INTO A VALUES ('a1', 'b1');
            INSERT INTO relations VALUES ('A', 'ref', 'B');
            "#,
        )
        .unwrap();
    }

    let mut conn = pipeline::open(&path).unwrap();
    let fk_enabled: i64 = conn
        .query_row("PRAGMA foreign_keys", [], |r| r.get(0))
        .unwrap();
    assert_eq!(fk_enabled, 0);

    let options = PipelineOptions {
        strip: true,
        ..PipelineOptions::default()
    };
    let report = pipeline::run(&mut conn, &StagingSettings::default(), &options).unwrap();
    drop(conn);

    assert!(matches!(report.strip, StripOutcome::Completed(_)));
    let conn = Connection::open(&path).unwrap();
    assert_eq!(references(&conn, "A", "ref"), vec!["B"]);
    assert!(!Catalog::new(&conn).table_exists("uids").unwrap());
    assert!(!Catalog::new(&conn).table_exists("relations").unwrap());
}
