//! End-to-end mission runs against the scripted oracle and backend.
//!
//! Each test drives `Orchestrator::run` to completion or failure and checks
//! the backend call counts, so every exit path is shown to release exactly once.

use std::fs;
use std::path::Path;

use codeloop::cancel::Interrupted;
use codeloop::context::RunContext;
use codeloop::core::budget::IterationBudget;
use codeloop::core::transaction::TransactionKind;
use codeloop::core::types::Purpose;
use codeloop::core::verdict::CompletionMatch;
use codeloop::io::backend::BackendError;
use codeloop::mission::{MissionOutcome, MissionRequest, MissionSettings, MissionStop, Orchestrator};
use codeloop::test_support::{ScriptedBackend, ScriptedOracle};

fn data_dir(root: &Path) -> MissionRequest {
    let source = root.join("data");
    fs::create_dir_all(&source).expect("data dir");
    fs::write(source.join("data.csv"), "a,1\nb,2\nc,3\n").expect("csv");
    MissionRequest {
        mission: "count the lines in data.csv and write the count to result.txt".to_string(),
        source,
        output: root.join("out"),
    }
}

fn settings(max_iterations: u32) -> MissionSettings {
    MissionSettings {
        budget: IterationBudget::new(max_iterations),
        completion: CompletionMatch::Loose,
        ask_for_packages: false,
    }
}

fn never_done() -> ScriptedOracle {
    ScriptedOracle::new()
        .fallback(Purpose::WhatDidWeDo, "read the file")
        .fallback(Purpose::WhatToDo, "count the lines")
        .fallback(Purpose::GenerateCode, "console.log(3)")
        .fallback(Purpose::EvaluateCode, "NOTSOLVED")
}

fn run(
    oracle: &ScriptedOracle,
    backend: &mut ScriptedBackend,
    settings: MissionSettings,
    request: &MissionRequest,
    ctx: &RunContext,
) -> anyhow::Result<MissionOutcome> {
    Orchestrator::new(oracle, settings, ctx)?.run(request, backend)
}

fn is_interrupted(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<Interrupted>())
}

#[test]
fn budget_of_three_runs_three_rounds_then_exports() {
    let temp = tempfile::tempdir().expect("tempdir");
    let request = data_dir(temp.path());
    let oracle = never_done();
    let mut backend = ScriptedBackend::new().output("3");

    let outcome = run(&oracle, &mut backend, settings(3), &request, &RunContext::quiet()).expect("run");

    assert_eq!(outcome.rounds, 3);
    assert_eq!(outcome.stop, MissionStop::BudgetExhausted { max_iterations: 3 });
    let calls = backend.calls();
    assert_eq!(calls.execute, 3);
    assert_eq!(calls.export, 1);
    assert_eq!(calls.release, 1);
    assert_eq!(oracle.count(Purpose::EvaluateCode), 3);
    // No summary on round 1.
    assert_eq!(oracle.count(Purpose::WhatDidWeDo), 2);
    assert!(!backend.is_live());
}

#[test]
fn rounds_alternate_output_and_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let request = data_dir(temp.path());
    let oracle = never_done();
    let mut backend = ScriptedBackend::new().outputs(["one", "two", "three", "four"]);

    let outcome = run(&oracle, &mut backend, settings(4), &request, &RunContext::quiet()).expect("run");

    let kinds: Vec<TransactionKind> = outcome.log.entries().iter().map(|t| t.kind).collect();
    assert_eq!(kinds.len(), 9);
    for (i, kind) in kinds.iter().enumerate() {
        let expected = if i % 2 == 0 {
            TransactionKind::Output
        } else {
            TransactionKind::Code
        };
        assert_eq!(*kind, expected, "entry {i}");
    }
    assert_eq!(outcome.log.entries()[0].payload, None);
    assert_eq!(outcome.log.rounds(), 4);
    assert_eq!(outcome.log.last().and_then(|t| t.payload.as_deref()), Some("four"));
}

#[test]
fn failure_in_second_execute_releases_exactly_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let request = data_dir(temp.path());
    let oracle = never_done();
    let mut backend = ScriptedBackend::new().fail_execute_on(2);

    let err = run(&oracle, &mut backend, settings(5), &request, &RunContext::quiet()).unwrap_err();

    assert_eq!(err.to_string(), "round 2: execute");
    assert!(format!("{err:#}").contains("scripted execution failure in run 2"));
    let calls = backend.calls();
    assert_eq!(calls.acquire, 1);
    assert_eq!(calls.execute, 2);
    assert_eq!(calls.export, 0);
    assert_eq!(calls.release, 1);
    assert!(!backend.is_live());
}

#[test]
fn import_failure_releases_exactly_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let request = data_dir(temp.path());
    let oracle = never_done();
    let mut backend = ScriptedBackend::new().fail_import();
    let ctx = RunContext::quiet();

    let err = run(&oracle, &mut backend, settings(3), &request, &ctx).unwrap_err();

    assert_eq!(err.to_string(), "import dataset");
    assert!(format!("{err:#}").contains("scripted import failure"));
    let calls = backend.calls();
    assert_eq!(calls.import, 1);
    assert_eq!(calls.execute, 0);
    assert_eq!(calls.release, 1);
    assert!(oracle.requests().is_empty());
    assert_eq!(ctx.live_session(), None);
}

#[test]
fn export_failure_releases_exactly_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let request = data_dir(temp.path());
    let oracle = never_done();
    let mut backend = ScriptedBackend::new().output("3").fail_export();
    let ctx = RunContext::quiet();

    let err = run(&oracle, &mut backend, settings(2), &request, &ctx).unwrap_err();

    assert_eq!(err.to_string(), "export dataset");
    assert!(format!("{err:#}").contains("scripted export failure"));
    let calls = backend.calls();
    assert_eq!(calls.execute, 2);
    assert_eq!(calls.export, 1);
    assert_eq!(calls.release, 1);
    assert!(!backend.is_live());
    assert_eq!(ctx.live_session(), None);
}

#[test]
fn line_count_mission_completes_and_exports_result() {
    let temp = tempfile::tempdir().expect("tempdir");
    let request = data_dir(temp.path());
    let code = "const fs = require('fs');\n\
                const count = fs.readFileSync('data.csv', 'utf8').trim().split('\\n').length;\n\
                console.log(`lines: ${count}`);\n\
                fs.writeFileSync('result.txt', String(count));\n\
                console.log('wrote result.txt');";
    let oracle = ScriptedOracle::new()
        .respond(Purpose::WhatToDo, "데이터 파일을 읽고 줄 수를 계산한다")
        .respond(Purpose::GenerateCode, format!("```javascript\n{code}\n```"))
        .respond(Purpose::PackageNames, "[]")
        .respond(Purpose::EvaluateCode, "ENDOFMISSION");
    let mut backend = ScriptedBackend::new()
        .output("lines: 3\nwrote result.txt\n")
        .export_file("result.txt", "3");
    let settings = MissionSettings {
        ask_for_packages: true,
        ..settings(0)
    };

    let outcome = run(&oracle, &mut backend, settings, &request, &RunContext::quiet()).expect("run");

    assert_eq!(outcome.stop, MissionStop::Completed);
    assert_eq!(outcome.rounds, 1);
    assert_eq!(
        oracle.purposes(),
        [
            Purpose::WhatToDo,
            Purpose::GenerateCode,
            Purpose::PackageNames,
            Purpose::EvaluateCode
        ]
    );
    assert_eq!(backend.imported(), ["data.csv"]);
    assert_eq!(backend.executed()[0].code, code);
    assert!(backend.executed()[0].packages.is_empty());

    let evaluation = &oracle.requests()[3];
    let tail = &evaluation.messages.last().expect("tail").content;
    assert!(tail.contains("lines: 3"));

    let result = fs::read_to_string(request.output.join("result.txt")).expect("result.txt");
    assert_eq!(result, "3");
    assert_eq!(backend.calls().release, 1);
}

#[test]
fn prose_mentioning_the_continue_token_keeps_going() {
    let temp = tempfile::tempdir().expect("tempdir");
    let request = data_dir(temp.path());
    let oracle = never_done()
        .respond(Purpose::EvaluateCode, "결과는 NOTSOLVED 입니다")
        .respond(Purpose::EvaluateCode, "ENDOFMISSION");
    let mut backend = ScriptedBackend::new().output("3");

    let outcome = run(&oracle, &mut backend, settings(5), &request, &RunContext::quiet()).expect("run");

    assert_eq!(outcome.stop, MissionStop::Completed);
    assert_eq!(outcome.rounds, 2);
}

#[test]
fn strict_matching_ignores_prose_completion() {
    let temp = tempfile::tempdir().expect("tempdir");
    let request = data_dir(temp.path());
    let oracle = never_done().respond(Purpose::EvaluateCode, "근거 충분 ENDOFMISSION");
    let mut backend = ScriptedBackend::new().output("3");
    let settings = MissionSettings {
        completion: CompletionMatch::Strict,
        ..settings(2)
    };

    let outcome = run(&oracle, &mut backend, settings, &request, &RunContext::quiet()).expect("run");

    assert_eq!(outcome.stop, MissionStop::BudgetExhausted { max_iterations: 2 });
}

#[test]
fn interrupt_before_start_acquires_nothing() {
    let temp = tempfile::tempdir().expect("tempdir");
    let request = data_dir(temp.path());
    let ctx = RunContext::quiet();
    assert!(ctx.interrupt());
    let oracle = never_done();
    let mut backend = ScriptedBackend::new();

    let err = run(&oracle, &mut backend, settings(3), &request, &ctx).unwrap_err();

    assert!(is_interrupted(&err));
    assert_eq!(backend.calls().acquire, 0);
    assert_eq!(backend.calls().release, 0);
    assert!(oracle.requests().is_empty());
}

#[test]
fn interrupt_during_execution_releases_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let request = data_dir(temp.path());
    let ctx = RunContext::quiet();
    let oracle = never_done();
    let mut backend = ScriptedBackend::new().cancel_on_execute(2, ctx.cancel.clone());

    let err = run(&oracle, &mut backend, settings(0), &request, &ctx).unwrap_err();

    assert!(is_interrupted(&err));
    assert!(ctx.cancel.is_cancelled());
    let calls = backend.calls();
    assert_eq!(calls.execute, 2);
    assert_eq!(calls.export, 0);
    assert_eq!(calls.release, 1);
}

#[test]
fn interrupt_while_waiting_on_the_oracle_releases_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let request = data_dir(temp.path());
    let ctx = RunContext::quiet();
    let oracle = never_done().cancel_on(Purpose::EvaluateCode, ctx.cancel.clone());
    let mut backend = ScriptedBackend::new();

    let err = run(&oracle, &mut backend, settings(0), &request, &ctx).unwrap_err();

    assert!(is_interrupted(&err));
    assert_eq!(err.to_string(), "round 1: evaluate");
    assert_eq!(backend.calls().execute, 1);
    assert_eq!(backend.calls().release, 1);
}

#[test]
fn engine_failure_surfaces_without_release() {
    let temp = tempfile::tempdir().expect("tempdir");
    let request = data_dir(temp.path());
    let oracle = never_done();
    let mut backend = ScriptedBackend::new().fail_acquire();

    let err = run(&oracle, &mut backend, settings(3), &request, &RunContext::quiet()).unwrap_err();

    assert_eq!(err.downcast_ref::<BackendError>(), Some(&BackendError::EngineNotRunning));
    assert_eq!(backend.calls().import, 0);
    assert_eq!(backend.calls().release, 0);
}

#[test]
fn oracle_failure_is_fatal_and_cleans_up() {
    let temp = tempfile::tempdir().expect("tempdir");
    let request = data_dir(temp.path());
    let oracle = never_done().fail(Purpose::GenerateCode, "connection reset");
    let mut backend = ScriptedBackend::new();

    let err = run(&oracle, &mut backend, settings(3), &request, &RunContext::quiet()).unwrap_err();

    assert_eq!(err.to_string(), "round 1: generate");
    assert!(format!("{err:#}").contains("connection reset"));
    assert_eq!(backend.calls().execute, 0);
    assert_eq!(backend.calls().release, 1);
}

#[test]
fn missing_source_fails_before_acquiring() {
    let temp = tempfile::tempdir().expect("tempdir");
    let request = MissionRequest {
        mission: "anything".to_string(),
        source: temp.path().join("missing"),
        output: temp.path().join("out"),
    };
    let oracle = never_done();
    let mut backend = ScriptedBackend::new();

    let err = run(&oracle, &mut backend, settings(1), &request, &RunContext::quiet()).unwrap_err();

    assert!(format!("{err:#}").contains("is not a directory"));
    assert_eq!(backend.calls().acquire, 0);
}
