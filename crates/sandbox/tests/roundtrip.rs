//! End-to-end: steps applied by the engine, transpiled, and replayed in
//! the sandbox must land on identical data.

use std::time::Duration;

use tablog_engine::registry::FnArg;
use tablog_engine::state::{CellValue, Dtype, HeaderFormat};
use tablog_engine::step::{NewColumn, StepKind};
use tablog_engine::StepsManager;
use tablog_sandbox::{execute, fns};

const BUDGET: Duration = Duration::from_secs(10);

fn manager() -> StepsManager {
    StepsManager::new(fns::standard_registry())
}

fn orders_create() -> StepKind {
    StepKind::CreateTable {
        name: "orders".into(),
        columns: vec![
            NewColumn {
                id: "qty".into(),
                header: "qty".into(),
                dtype: Dtype::Int64,
                values: vec![CellValue::Int(1), CellValue::Int(2), CellValue::Missing],
            },
            NewColumn {
                id: "status".into(),
                header: "status".into(),
                dtype: Dtype::Str,
                values: vec![
                    CellValue::Str("open".into()),
                    CellValue::Str("closed".into()),
                    CellValue::Str("open".into()),
                ],
            },
            NewColumn {
                id: "paid".into(),
                header: "paid".into(),
                dtype: Dtype::Bool,
                values: vec![CellValue::Bool(true), CellValue::Bool(false), CellValue::Bool(true)],
            },
        ],
        header_format: HeaderFormat::default(),
    }
}

/// Replay the manager's generated code and compare every table.
fn assert_replay_matches(manager: &StepsManager) {
    let code = manager.code();
    let outcome = execute(&code, BUDGET).unwrap_or_else(|e| {
        panic!("generated code failed to replay: {}\noutput: {}\ncode:\n{}", e, e.output, code)
    });

    let state = manager.final_state();
    assert_eq!(outcome.tables.len(), state.table_count(), "code:\n{}", code);
    for engine_table in state.tables() {
        let replayed = outcome
            .tables
            .iter()
            .find(|(name, _)| name == &engine_table.name)
            .unwrap_or_else(|| panic!("table '{}' missing after replay", engine_table.name));
        assert!(
            engine_table.same_data(&replayed.1),
            "table '{}' diverged after replay\nengine: {:?}\nreplay: {:?}\ncode:\n{}",
            engine_table.name,
            engine_table,
            replayed.1,
            code
        );
    }
}

#[test]
fn test_create_and_replace_roundtrip() {
    let mut m = manager();
    m.append(orders_create()).unwrap();
    m.append(StepKind::Replace {
        table_index: 0,
        column_ids: vec!["status".into()],
        search_value: "open".into(),
        replace_value: "active".into(),
    })
    .unwrap();
    assert_replay_matches(&m);
}

#[test]
fn test_bool_column_replace_roundtrip() {
    let mut m = manager();
    m.append(orders_create()).unwrap();
    // Whole-table replace touching the bool column through the split path.
    m.append(StepKind::Replace {
        table_index: 0,
        column_ids: vec![],
        search_value: "false".into(),
        replace_value: "true".into(),
    })
    .unwrap();
    assert_replay_matches(&m);
}

#[test]
fn test_header_rename_roundtrip() {
    let mut m = manager();
    m.append(orders_create()).unwrap();
    m.append(StepKind::Replace {
        table_index: 0,
        column_ids: vec!["qty".into()],
        search_value: "qty".into(),
        replace_value: "count".into(),
    })
    .unwrap();
    assert_eq!(m.final_state().table(0).unwrap().columns[0].header, "count");
    assert_replay_matches(&m);
}

#[test]
fn test_transform_roundtrip() {
    let mut m = manager();
    m.append(orders_create()).unwrap();
    m.append(StepKind::TransformColumn {
        table_index: 0,
        column_id: "qty".into(),
        function: "fill_missing".into(),
        arg: FnArg::Int(0),
    })
    .unwrap();
    m.append(StepKind::TransformColumn {
        table_index: 0,
        column_id: "status".into(),
        function: "to_uppercase".into(),
        arg: FnArg::None,
    })
    .unwrap();
    assert_replay_matches(&m);
}

#[test]
fn test_coalesced_replaces_roundtrip() {
    let mut m = manager();
    m.append(orders_create()).unwrap();
    m.append(StepKind::Replace {
        table_index: 0,
        column_ids: vec!["status".into()],
        search_value: "open".into(),
        replace_value: "pending".into(),
    })
    .unwrap();
    m.append(StepKind::Replace {
        table_index: 0,
        column_ids: vec!["status".into()],
        search_value: "pending".into(),
        replace_value: "active".into(),
    })
    .unwrap();

    // The merged code replays to the same final data as the full chain.
    let code = m.code();
    assert_eq!(code.matches("tab.replace_pattern(").count(), 1, "{}", code);
    assert_replay_matches(&m);
}

#[test]
fn test_csv_export_roundtrip_writes_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("orders.csv");
    let path_str = path.to_string_lossy().into_owned();

    let mut m = manager();
    m.append(orders_create()).unwrap();
    m.append(StepKind::ExportCsv { targets: vec![(0, path_str.clone())] }).unwrap();
    assert_replay_matches(&m);

    let content = std::fs::read_to_string(&path).unwrap();
    let mut lines = content.lines();
    assert_eq!(lines.next(), Some("qty,status,paid"));
    assert_eq!(lines.next(), Some("1,open,true"));
    assert_eq!(lines.next(), Some("2,closed,false"));
    assert_eq!(lines.next(), Some(",open,true"), "missing qty exports as empty field");
}

#[test]
fn test_workbook_export_roundtrip_writes_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.xlsx");
    let path_str = path.to_string_lossy().into_owned();

    let mut m = manager();
    m.append(StepKind::CreateTable {
        name: "styled".into(),
        columns: vec![NewColumn {
            id: "A".into(),
            header: "A".into(),
            dtype: Dtype::Int64,
            values: vec![CellValue::Int(1)],
        }],
        header_format: HeaderFormat {
            color: Some("#FFFFFF".into()),
            background_color: Some("#549D3A".into()),
        },
    })
    .unwrap();
    m.append(StepKind::ExportWorkbook { path: path_str, table_indices: vec![0] }).unwrap();

    let code = m.code();
    assert!(code.contains("tab.style_headers("), "{}", code);
    assert_replay_matches(&m);
    assert!(path.exists());
}

#[test]
fn test_parameterized_function_replays_with_new_path() {
    use tablog_engine::transpiler::LiteralSelection;

    let dir = tempfile::tempdir().unwrap();
    let original = dir.path().join("a.csv");
    let rerun = dir.path().join("b.csv");

    let mut m = manager();
    m.append(orders_create()).unwrap();
    m.append(StepKind::ExportCsv {
        targets: vec![(0, original.to_string_lossy().into_owned())],
    })
    .unwrap();

    let parameterized = m
        .parameterize(0..m.cursor(), &[LiteralSelection { step_index: 1, literal_index: 0 }])
        .unwrap();
    assert_eq!(parameterized.inline(), m.code(), "inlined form must match the plain script");

    // Call the function with a different path than the one recorded.
    let script = format!(
        "{}\nrerun_edits(\"{}\")",
        parameterized.function_source,
        rerun.to_string_lossy()
    );
    execute(&script, BUDGET).unwrap();
    assert!(rerun.exists(), "rerun must write to the substituted path");
    assert!(!original.exists(), "original path must stay untouched");
}

#[test]
fn test_undo_drops_steps_from_replay() {
    let mut m = manager();
    m.append(orders_create()).unwrap();
    m.append(StepKind::Replace {
        table_index: 0,
        column_ids: vec!["status".into()],
        search_value: "open".into(),
        replace_value: "active".into(),
    })
    .unwrap();
    m.undo();
    assert_replay_matches(&m);

    let state = m.final_state();
    let status = &state.table(0).unwrap().columns[1];
    assert_eq!(status.values[0], CellValue::Str("open".into()));
}
