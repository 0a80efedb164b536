//! End-to-end runs of external tools through `/bin/sh`.
#![cfg(unix)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arrow::array::{Array, Int64Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema};
use xtool_codecs::CodecRegistry;
use xtool_core::{ChunkPolicy, Table};
use xtool_runner::{
    ChunkError, CleanupPolicy, ExecutorRegistry, ExternalToolRunner, HandleError, PortSettings,
    ProgressMonitor, RunState, RunnerConfig, SecondaryInputMode, ToolError, ToolSettings,
};

fn values(values: &[i64]) -> Table {
    let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, true)]));
    let batch =
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values.to_vec()))]).unwrap();
    Table::with_generated_keys(batch)
}

fn shell(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

fn runner(tmp: &Path, settings: ToolSettings) -> ExternalToolRunner {
    let config = RunnerConfig {
        tmp_dir: tmp.to_path_buf(),
        ..Default::default()
    };
    ExternalToolRunner::new(
        settings,
        config,
        Arc::new(ExecutorRegistry::with_defaults()),
        Arc::new(CodecRegistry::with_defaults()),
    )
}

fn entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[tokio::test]
async fn test_single_chunk_failure_reports_exit_code_and_stderr() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = ToolSettings {
        command: shell("echo starting; echo 'bad input' >&2; exit 3"),
        ..Default::default()
    };
    let mut runner = runner(tmp.path(), settings);

    let err = runner
        .execute(&[values(&[1, 2])], &ProgressMonitor::detached())
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Chunk 0: external tool exited with code 3: bad input"
    );
    assert_eq!(runner.state(), RunState::Failed);

    let capture = &runner.last_output()[&0];
    assert_eq!(capture.stdout.lines().collect::<Vec<_>>(), vec!["starting"]);
    assert_eq!(capture.stderr.last(), Some("bad input"));
}

#[tokio::test]
async fn test_copy_tool_joins_back_onto_input() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = ToolSettings {
        command: shell("cp %inFile% %outFile%"),
        ..Default::default()
    };
    let mut runner = runner(tmp.path(), settings);

    let outcome = runner
        .execute(&[values(&[10, 20, 30])], &ProgressMonitor::detached())
        .await
        .unwrap();
    assert_eq!(runner.state(), RunState::Done);
    assert!(outcome.warnings.is_empty());

    let table = &outcome.tables[0];
    assert_eq!(table.keys(), &["Row0", "Row1", "Row2"]);
    let schema = table.schema();
    let names: Vec<&str> = schema
        .fields()
        .iter()
        .map(|f| f.name().as_str())
        .collect();
    assert_eq!(names, vec!["v", "v (#1)"]);
}

#[tokio::test]
async fn test_missing_output_row_keeps_input_row() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = ToolSettings {
        command: shell("grep -v Row1 %inFile% > %outFile%"),
        ..Default::default()
    };
    let mut runner = runner(tmp.path(), settings);

    let outcome = runner
        .execute(&[values(&[10, 20, 30])], &ProgressMonitor::detached())
        .await
        .unwrap();
    let table = &outcome.tables[0];
    assert_eq!(table.keys(), &["Row0", "Row1", "Row2"]);
    let tool_side = table.column(1);
    assert!(tool_side.is_valid(0));
    assert!(tool_side.is_null(1));
    assert!(tool_side.is_valid(2));
}

#[tokio::test]
async fn test_numeric_looking_keys_survive_the_join() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = ToolSettings {
        command: shell("cp %inFile% %outFile%"),
        ..Default::default()
    };
    let mut runner = runner(tmp.path(), settings);
    let input = values(&[1, 2])
        .with_keys(vec!["007".to_string(), "008".to_string()])
        .unwrap();

    let outcome = runner
        .execute(&[input], &ProgressMonitor::detached())
        .await
        .unwrap();
    let table = &outcome.tables[0];
    assert_eq!(table.num_rows(), 2);
    assert_eq!(table.keys(), &["007", "008"]);
    let tool_side = table
        .column(1)
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap();
    assert_eq!(tool_side.null_count(), 0);
    assert_eq!(&tool_side.values()[..], &[1, 2]);
}

#[tokio::test]
async fn test_stale_output_file_is_not_read_back() {
    let tmp = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let out = data.path().join("out.csv");
    std::fs::write(&out, "RowID,v\nRow0,99\n").unwrap();
    let mut settings = ToolSettings {
        command: shell("true"),
        ..Default::default()
    };
    settings.outputs[0].path = Some(out.clone());
    let mut runner = runner(tmp.path(), settings);

    let err = runner
        .execute(&[values(&[1])], &ProgressMonitor::detached())
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            ToolError::Chunk(ChunkError::Read {
                source: HandleError::Missing(_),
                ..
            })
        ),
        "{}",
        err
    );
    assert!(!out.exists());
}

#[tokio::test]
async fn test_chunks_with_different_columns_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let mut settings = ToolSettings {
        command: shell(
            "if grep -q Row0 %inFile%; then printf 'RowID,a\\nx,1\\n' > %outFile%; \
             else printf 'RowID,b\\ny,2\\n' > %outFile%; fi",
        ),
        chunking: ChunkPolicy::IndividualRow,
        ..Default::default()
    };
    settings.join.enabled = false;
    let mut runner = runner(tmp.path(), settings);

    let err = runner
        .execute(&[values(&[1, 2])], &ProgressMonitor::detached())
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::SchemaInconsistency(_)), "{}", err);
    assert_eq!(runner.state(), RunState::Failed);
}

#[tokio::test]
async fn test_empty_input_runs_one_chunk() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = ToolSettings {
        command: shell("cp %inFile% %outFile%"),
        chunking: ChunkPolicy::IndividualRow,
        ..Default::default()
    };
    let mut runner = runner(tmp.path(), settings);

    let outcome = runner
        .execute(&[values(&[])], &ProgressMonitor::detached())
        .await
        .unwrap();
    assert_eq!(outcome.tables[0].num_rows(), 0);
    assert!(outcome.failed_chunks.is_empty());
    assert_eq!(runner.last_output().len(), 1);
    assert_eq!(runner.state(), RunState::Done);
}

#[tokio::test]
async fn test_chunked_run_produces_unique_keys() {
    let tmp = tempfile::tempdir().unwrap();
    let mut settings = ToolSettings {
        command: shell("cp %inFile% %outFile%"),
        chunking: ChunkPolicy::ChunksOfSize(2),
        ..Default::default()
    };
    settings.join.enabled = false;
    let mut runner = runner(tmp.path(), settings);

    let outcome = runner
        .execute(&[values(&[1, 2, 3, 4, 5])], &ProgressMonitor::detached())
        .await
        .unwrap();
    let table = &outcome.tables[0];
    assert_eq!(table.num_rows(), 5);
    let keys: HashSet<&String> = table.keys().iter().collect();
    assert_eq!(keys.len(), 5);
    assert_eq!(runner.last_output().len(), 3);
    assert_eq!(runner.metrics().chunks_succeeded.get(), 3);
}

#[tokio::test]
async fn test_chunked_run_with_join_restores_input_keys() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = ToolSettings {
        command: shell("cp %inFile% %outFile%"),
        chunking: ChunkPolicy::IndividualRow,
        ..Default::default()
    };
    let mut runner = runner(tmp.path(), settings);

    let outcome = runner
        .execute(&[values(&[7, 8, 9])], &ProgressMonitor::detached())
        .await
        .unwrap();
    let table = &outcome.tables[0];
    assert_eq!(table.keys(), &["Row0", "Row1", "Row2"]);
    let tool_side = table
        .column(1)
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap();
    assert_eq!(&tool_side.values()[..], &[7, 8, 9]);
}

#[tokio::test]
async fn test_partial_failure_keeps_successful_rows() {
    let tmp = tempfile::tempdir().unwrap();
    let mut settings = ToolSettings {
        command: shell("if grep -q Row1 %inFile%; then echo nope >&2; exit 1; fi; cp %inFile% %outFile%"),
        chunking: ChunkPolicy::NrChunks(3),
        ..Default::default()
    };
    settings.join.enabled = false;
    let mut runner = runner(tmp.path(), settings);

    let outcome = runner
        .execute(&[values(&[1, 2, 3])], &ProgressMonitor::detached())
        .await
        .unwrap();
    assert_eq!(outcome.tables[0].num_rows(), 2);
    assert_eq!(outcome.failed_chunks.len(), 1);
    assert_eq!(outcome.failed_chunks[0].index, 1);

    let warning = outcome.warning_message().unwrap();
    assert!(warning.starts_with("1 of 3 chunks failed:\n"), "{}", warning);
    assert!(warning.contains("Chunk 1: external tool exited with code 1: nope"));
}

#[tokio::test]
async fn test_all_chunks_failing_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = ToolSettings {
        command: shell("exit 4"),
        chunking: ChunkPolicy::NrChunks(2),
        ..Default::default()
    };
    let mut runner = runner(tmp.path(), settings);

    let err = runner
        .execute(&[values(&[1, 2])], &ProgressMonitor::detached())
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::Chunk(_)));
    assert_eq!(runner.state(), RunState::Failed);
}

#[tokio::test]
async fn test_two_input_ports_get_distinct_paths() {
    let tmp = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let shared = data.path().join("in.csv");
    let mut settings = ToolSettings {
        command: shell("cp %inFile_1% %outFile%"),
        inputs: vec![
            PortSettings {
                path: Some(shared.clone()),
                ..Default::default()
            },
            PortSettings {
                path: Some(shared),
                ..Default::default()
            },
        ],
        ..Default::default()
    };
    settings.join.enabled = false;
    let mut runner = runner(tmp.path(), settings);

    let outcome = runner
        .execute(
            &[values(&[1]), values(&[1, 2, 3])],
            &ProgressMonitor::detached(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.tables[0].num_rows(), 3);
    // User-supplied locations are never deleted.
    assert!(data.path().join("in_0.csv").is_file());
    assert!(data.path().join("in_1.csv").is_file());
}

#[tokio::test]
async fn test_secondary_port_written_once_for_all_chunks() {
    let tmp = tempfile::tempdir().unwrap();
    let mut settings = ToolSettings {
        command: shell("echo %inFile_1% >&2; cp %inFile% %outFile%"),
        inputs: vec![PortSettings::default(), PortSettings::default()],
        chunking: ChunkPolicy::IndividualRow,
        secondary_inputs: SecondaryInputMode::SingleChunk,
        ..Default::default()
    };
    settings.join.enabled = false;
    let mut runner = runner(tmp.path(), settings);

    runner
        .execute(&[values(&[1, 2]), values(&[5])], &ProgressMonitor::detached())
        .await
        .unwrap();
    let paths: HashSet<Option<&str>> = runner
        .last_output()
        .values()
        .map(|capture| capture.stderr.last())
        .collect();
    assert_eq!(paths.len(), 1);
    assert_eq!(runner.metrics().rows_written.get(), 3);
}

#[tokio::test]
async fn test_cancellation_stops_running_tool() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = ToolSettings {
        command: shell("exec sleep 30"),
        ..Default::default()
    };
    let mut runner = runner(tmp.path(), settings);

    let monitor = ProgressMonitor::detached();
    let token = monitor.token().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
    });

    let started = Instant::now();
    let err = runner
        .execute(&[values(&[1])], &monitor)
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(runner.state(), RunState::Failed);
}

#[tokio::test]
async fn test_cleanup_all_removes_working_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = ToolSettings {
        command: shell("cp %inFile% %outFile%"),
        chunking: ChunkPolicy::NrChunks(2),
        ..Default::default()
    };
    let mut runner = runner(tmp.path(), settings);

    runner
        .execute(&[values(&[1, 2])], &ProgressMonitor::detached())
        .await
        .unwrap();
    assert_eq!(entries(tmp.path()), 0);
}

#[tokio::test]
async fn test_cleanup_none_keeps_files() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = ToolSettings {
        command: shell("cp %inFile% %outFile%"),
        cleanup: CleanupPolicy::None,
        ..Default::default()
    };
    let mut runner = runner(tmp.path(), settings);

    runner
        .execute(&[values(&[1])], &ProgressMonitor::detached())
        .await
        .unwrap();
    drop(runner);
    assert_eq!(entries(tmp.path()), 1);
}

#[tokio::test]
async fn test_cleanup_only_non_failed_keeps_failed_chunk() {
    let tmp = tempfile::tempdir().unwrap();
    let mut settings = ToolSettings {
        command: shell("if grep -q Row0 %inFile%; then exit 1; fi; cp %inFile% %outFile%"),
        chunking: ChunkPolicy::IndividualRow,
        cleanup: CleanupPolicy::OnlyNonFailed,
        ..Default::default()
    };
    settings.join.enabled = false;
    let mut runner = runner(tmp.path(), settings);

    let outcome = runner
        .execute(&[values(&[1, 2])], &ProgressMonitor::detached())
        .await
        .unwrap();
    let warning = outcome.warning_message().unwrap();
    assert!(warning.contains("failed chunk(s) 0 were not deleted"), "{}", warning);

    let work_dir = std::fs::read_dir(tmp.path())
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    assert!(work_dir.join("input").join("port0.csv").is_file());
    assert!(!work_dir.join("input").join("port0_1.csv").exists());
    assert!(!work_dir.join("output").join("port0_1.csv").exists());
}

#[tokio::test]
async fn test_configure_reports_schema_only_for_existing_outputs() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = ToolSettings {
        command: shell("cp %inFile% %outFile%"),
        ..Default::default()
    };
    let input = values(&[1]).schema();
    assert!(runner(tmp.path(), settings.clone())
        .configure(&[input.clone()])
        .unwrap()
        .is_none());

    let out = tmp.path().join("result.csv");
    std::fs::write(&out, "RowID,score\nRow0,0.5\n").unwrap();
    let mut settings = settings;
    settings.outputs[0].path = Some(out);
    settings.join.enabled = false;
    let schemas = runner(tmp.path(), settings)
        .configure(&[input])
        .unwrap()
        .unwrap();
    assert_eq!(schemas[0].field(1).name(), "score");
    assert_eq!(schemas[0].field(1).data_type(), &DataType::Float64);
}

#[tokio::test]
async fn test_flow_variables_reach_the_command() {
    let tmp = tempfile::tempdir().unwrap();
    let mut settings = ToolSettings {
        command: shell("echo $(label) >&2; cp %inFile% %outFile%"),
        ..Default::default()
    };
    settings
        .variables
        .string
        .insert("label".to_string(), "batch-7".to_string());
    let mut runner = runner(tmp.path(), settings);

    runner
        .execute(&[values(&[1])], &ProgressMonitor::detached())
        .await
        .unwrap();
    assert_eq!(runner.last_output()[&0].stderr.last(), Some("batch-7"));
}
