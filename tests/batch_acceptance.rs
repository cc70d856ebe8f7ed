/// Acceptance tests for batch execution
///
/// These run whole batches through the library API: step caching, dependency
/// key propagation, the filter chain and publishing.
mod common;

use common::{math_registry, CallCounter, TestWorkspace};
use precis::config::{FilterConfig, RemoteConfig, StepConfig};
use precis::function::RunOutcome;
use precis::{Batch, PrecisError};
use serde_json::json;
use std::fs;
use std::path::Path;

const SUM_TEMPLATE: &str = "sum is {{ data['add_numbers']['function_output'] }}";

fn add_numbers(a: i64, b: i64) -> StepConfig {
    StepConfig::new("add_numbers", json!({"a": a, "b": b})).with_function("add")
}

fn remove_files_with_ext(dir: &Path, ext: &str) -> usize {
    let mut removed = 0;
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry.unwrap();
        if entry.file_type().is_file() && entry.path().extension().is_some_and(|e| e == ext) {
            fs::remove_file(entry.path()).unwrap();
            removed += 1;
        }
    }
    removed
}

#[test]
fn test_add_numbers_renders_and_is_cached() {
    let ws = TestWorkspace::new();
    let calls = CallCounter::default();

    let config = ws.config(SUM_TEMPLATE, vec![add_numbers(2, 3)]);
    let first = Batch::new(config.clone(), math_registry(&calls))
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(ws.output("template.md"), "sum is 5");
    assert_eq!(first.executed(), 1);
    let published = fs::read(ws.output_dir().join("template.md")).unwrap();

    let second = Batch::new(config, math_registry(&calls))
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(calls.get(), 1);
    assert_eq!(second.executed(), 0);
    assert_eq!(second.steps[0].outcome, RunOutcome::Local);
    assert_eq!(second.steps[0].key, first.steps[0].key);
    assert_eq!(fs::read(ws.output_dir().join("template.md")).unwrap(), published);
}

#[test]
fn test_restores_from_remote_into_empty_cache() {
    let ws = TestWorkspace::new();
    let calls = CallCounter::default();
    let steps = vec![
        StepConfig::new("table", json!({"rows": 3})).with_function("table"),
        add_numbers(2, 3),
    ];
    let template = "{{ data.add_numbers.function_output }} {{ data.table.function_output }}";

    let mut config = ws.config(template, steps.clone());
    config.remotes = vec![RemoteConfig::Filesystem {
        path: ws.bucket_dir(),
    }];
    Batch::new(config, math_registry(&calls))
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(calls.get(), 2);

    // Another machine: empty local cache, same bucket
    let other_cache = ws.path().join("other-cache");
    let mut config = ws.config_with_cache(&other_cache, template, steps);
    config.remotes = vec![RemoteConfig::Filesystem {
        path: ws.bucket_dir(),
    }];
    let report = Batch::new(config, math_registry(&calls))
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(calls.get(), 2);
    assert!(report
        .steps
        .iter()
        .all(|s| s.outcome == RunOutcome::Restored));
    assert_eq!(ws.output("template.md"), "5 3");
    assert!(ws.output("table.csv").contains("3,9"));
}

#[test]
fn test_depends_propagates_key_changes() {
    let ws = TestWorkspace::new();
    let calls = CallCounter::default();
    let steps = |a: i64| {
        vec![
            add_numbers(a, 1),
            StepConfig::new("doubled", json!({"x": 4, "depends": ["add_numbers"]}))
                .with_function("double"),
            StepConfig::new("unrelated", json!({"x": 10})).with_function("double"),
        ]
    };
    let template = "{{ data.doubled.function_output }}";

    let before = Batch::new(ws.config(template, steps(1)), math_registry(&calls))
        .unwrap()
        .plan()
        .unwrap();
    let after = Batch::new(ws.config(template, steps(2)), math_registry(&calls))
        .unwrap()
        .plan()
        .unwrap();

    assert_ne!(before[0].key, after[0].key);
    // Own arguments unchanged, upstream changed
    assert_ne!(before[1].key, after[1].key);
    assert_eq!(before[2].key, after[2].key);
}

#[test]
fn test_changing_one_step_reruns_only_it_and_dependents() {
    let ws = TestWorkspace::new();
    let calls = CallCounter::default();
    let steps = |a: i64| {
        vec![
            add_numbers(a, 1),
            StepConfig::new("doubled", json!({"x": 4, "depends": ["add_numbers"]}))
                .with_function("double"),
            StepConfig::new("unrelated", json!({"x": 10})).with_function("double"),
        ]
    };
    let template = "{{ data.unrelated.function_output }}";

    Batch::new(ws.config(template, steps(1)), math_registry(&calls))
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(calls.get(), 3);

    let report = Batch::new(ws.config(template, steps(2)), math_registry(&calls))
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(calls.get(), 5);
    let outcomes: Vec<RunOutcome> = report.steps.iter().map(|s| s.outcome).collect();
    assert_eq!(
        outcomes,
        vec![RunOutcome::Executed, RunOutcome::Executed, RunOutcome::Local]
    );
    assert_eq!(ws.output("template.md"), "20");
}

#[test]
fn test_uppercase_filter_chain() {
    let ws = TestWorkspace::new();
    let calls = CallCounter::default();
    let mut config = ws.config("hello", Vec::new());
    config.filters = vec![FilterConfig::new("uppercase", "txt")];

    let first = Batch::new(config.clone(), math_registry(&calls))
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(ws.output("template.txt"), "HELLO");

    let second = Batch::new(config, math_registry(&calls))
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(second.documents[1].key, first.documents[1].key);
    assert!(!first.documents[1].cached);
    assert!(second.documents[1].cached);
    assert_eq!(ws.output("template.txt"), "HELLO");
}

#[test]
fn test_markdown_chain_publishes_every_stage() {
    let ws = TestWorkspace::new();
    let calls = CallCounter::default();
    let template = "# Sum\n\n{{ data.add_numbers.function_output }}";
    let mut config = ws.config(template, vec![add_numbers(1, 1)]);
    config.filters = vec![
        FilterConfig::new("markdown", "html"),
        FilterConfig::new("uppercase", "txt"),
    ];

    let report = Batch::new(config, math_registry(&calls))
        .unwrap()
        .run()
        .unwrap();

    let names: Vec<&str> = report
        .documents
        .iter()
        .map(|d| d.canonical_name.as_str())
        .collect();
    assert_eq!(names, vec!["template.md", "template.html", "template.txt"]);
    assert!(ws.output("template.html").contains("<h1>Sum</h1>"));
    assert!(ws.output("template.txt").contains("<H1>SUM</H1>"));
}

#[test]
fn test_supplemental_files_flow_to_steps_templates_and_output() {
    let ws = TestWorkspace::new();
    let calls = CallCounter::default();
    let steps = vec![
        StepConfig::new("table", json!({"rows": 4})).with_function("table"),
        StepConfig::new("summary", json!({"depends": ["table"]})).with_function("summary"),
    ];
    let template = "rows={{ data.summary.function_output }}\n{{ read_file_contents('table.csv') }}";

    Batch::new(ws.config(template, steps), math_registry(&calls))
        .unwrap()
        .run()
        .unwrap();

    let rendered = ws.output("template.md");
    assert!(rendered.starts_with("rows=4\n"));
    assert!(rendered.contains("4,16"));
    assert_eq!(ws.output("table.csv").lines().count(), 5);
}

#[test]
fn test_missing_supplemental_file_is_cache_inconsistency() {
    let ws = TestWorkspace::new();
    let calls = CallCounter::default();
    let steps = vec![StepConfig::new("table", json!({"rows": 2})).with_function("table")];
    let mut config = ws.config("{{ data.table.function_output }}", steps.clone());
    config.remotes = vec![RemoteConfig::Filesystem {
        path: ws.bucket_dir(),
    }];
    Batch::new(config, math_registry(&calls))
        .unwrap()
        .run()
        .unwrap();

    // The metadata survives in the bucket, the file it references does not
    assert_eq!(remove_files_with_ext(&ws.bucket_dir(), "csv"), 1);

    let other_cache = ws.path().join("other-cache");
    let mut config = ws.config_with_cache(&other_cache, "{{ data.table.function_output }}", steps);
    config.remotes = vec![RemoteConfig::Filesystem {
        path: ws.bucket_dir(),
    }];
    let result = Batch::new(config, math_registry(&calls)).unwrap().run();

    assert!(matches!(
        result,
        Err(PrecisError::CacheInconsistency { .. })
    ));
    assert_eq!(calls.get(), 1);
}

#[test]
fn test_locally_evicted_file_without_remote_is_cache_inconsistency() {
    let ws = TestWorkspace::new();
    let calls = CallCounter::default();
    let config = ws.config(
        "{{ data.table.function_output }}",
        vec![StepConfig::new("table", json!({"rows": 2})).with_function("table")],
    );
    Batch::new(config.clone(), math_registry(&calls))
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(remove_files_with_ext(&ws.cache_dir(), "csv"), 1);

    assert!(matches!(
        Batch::new(config, math_registry(&calls)).unwrap().run(),
        Err(PrecisError::CacheInconsistency { .. })
    ));
}

#[test]
fn test_failing_step_writes_no_metadata() {
    let ws = TestWorkspace::new();
    let calls = CallCounter::default();
    let config = ws.config(
        "{{ data.bad.function_output }}",
        vec![StepConfig::new("bad", json!({"rows": 1})).with_function("summary")],
    );

    // `summary` reads table.csv from a step that never ran
    match Batch::new(config.clone(), math_registry(&calls)).unwrap().run() {
        Err(PrecisError::Execution { step, .. }) => assert_eq!(step, "bad"),
        other => panic!("expected Execution error, got {other:?}"),
    }
    let plan = Batch::new(config, math_registry(&calls))
        .unwrap()
        .plan()
        .unwrap();
    assert!(!plan[0].cached);
}

#[test]
fn test_parallel_steps_with_same_key_execute_once() {
    let ws = TestWorkspace::new();
    let calls = CallCounter::default();
    let steps = vec![
        StepConfig::new("first", json!({"a": 2, "b": 3})).with_function("add"),
        StepConfig::new("second", json!({"a": 2, "b": 3})).with_function("add"),
    ];
    let template = "{{ data.first.function_output }}/{{ data.second.function_output }}";

    let mut config = ws.config(template, steps);
    config.jobs = 2;
    let report = Batch::new(config, math_registry(&calls))
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(calls.get(), 1);
    assert_eq!(report.steps[0].key, report.steps[1].key);
    assert_eq!(report.steps[1].outcome, RunOutcome::Local);
    assert_eq!(ws.output("template.md"), "5/5");
}

#[test]
fn test_parallel_batch_matches_sequential() {
    let ws = TestWorkspace::new();
    let calls = CallCounter::default();
    let steps = vec![
        add_numbers(2, 3),
        StepConfig::new("table", json!({"rows": 2})).with_function("table"),
        StepConfig::new("summary", json!({"depends": ["table"]})).with_function("summary"),
        StepConfig::new("doubled", json!({"x": 7})).with_function("double"),
    ];
    let template = "{{ data.add_numbers.function_output }} \
                    {{ data.summary.function_output }} \
                    {{ data.doubled.function_output }}";

    let mut config = ws.config(template, steps);
    config.jobs = 4;
    let report = Batch::new(config, math_registry(&calls))
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(ws.output("template.md"), "5 2 14");
    let ids: Vec<&str> = report.steps.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["add_numbers", "table", "summary", "doubled"]);
    assert_eq!(calls.get(), 4);
}

#[test]
fn test_output_dir_only_holds_current_batch() {
    let ws = TestWorkspace::new();
    let calls = CallCounter::default();
    fs::create_dir_all(ws.output_dir()).unwrap();
    fs::write(ws.output_dir().join("stale.html"), "old").unwrap();

    Batch::new(ws.config("fresh", Vec::new()), math_registry(&calls))
        .unwrap()
        .run()
        .unwrap();

    assert!(!ws.output_dir().join("stale.html").exists());
    assert_eq!(ws.output("template.md"), "fresh");
}

#[test]
fn test_template_files_each_run_through_chain() {
    let ws = TestWorkspace::new();
    let calls = CallCounter::default();
    let templates = ws.path().join("templates");
    fs::create_dir_all(&templates).unwrap();
    fs::write(templates.join("report.md"), "sum {{ data.add_numbers.function_output }}").unwrap();
    fs::write(templates.join("notes.md"), "notes").unwrap();

    let mut config = ws.config("", vec![add_numbers(2, 3)]);
    config.template.text = None;
    config.filters = vec![FilterConfig::new("uppercase", "txt")];

    let report = Batch::new(config, math_registry(&calls))
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(report.documents.len(), 4);
    assert_eq!(ws.output("report.txt"), "SUM 5");
    assert_eq!(ws.output("notes.txt"), "NOTES");
}
