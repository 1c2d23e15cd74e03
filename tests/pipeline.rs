use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use assert_matches::assert_matches;

use shanoir_bids::error::BidsError;
use shanoir_bids::pipeline::{
    FailurePolicy, Invocation, Pipeline, Step, StepStatus, ToolRunner,
};

/// Writes every path passed after `-o`/`-O`, except for the steps told to fail or stay silent.
#[derive(Default)]
struct FakeTools {
    failing: Vec<&'static str>,
    silent: Vec<&'static str>,
    calls: Mutex<Vec<String>>,
}

impl ToolRunner for FakeTools {
    fn run(&self, step: &str, invocation: &Invocation) -> Result<(), BidsError> {
        self.calls.lock().unwrap().push(step.to_string());
        if self.failing.iter().any(|name| *name == step) {
            return Err(BidsError::StepFailed {
                step: step.to_string(),
                status: "exit 1".to_string(),
                message: "boom".to_string(),
            });
        }
        if self.silent.iter().any(|name| *name == step) {
            return Ok(());
        }
        let mut args = invocation.args.iter();
        while let Some(arg) = args.next() {
            if arg == "-o" || arg == "-O" {
                if let Some(path) = args.next() {
                    fs::write(path, b"out").unwrap();
                }
            }
        }
        Ok(())
    }
}

fn tool_step(name: &str, input: &Path, output: &Path) -> Step {
    Step::exec(
        name,
        Invocation::new(format!("/opt/anima/{name}"))
            .flag_path("-i", input)
            .flag_path("-o", output),
    )
    .reads([input.to_path_buf()])
    .writes([output.to_path_buf()])
}

struct Chain {
    _temp: tempfile::TempDir,
    pipeline: Pipeline,
    dir: PathBuf,
}

// a -> b -> c, and d depends on a only.
fn chain() -> Chain {
    let temp = tempfile::tempdir().unwrap();
    let dir = temp.path().to_path_buf();
    let input = dir.join("dwi.nii.gz");
    fs::write(&input, b"dwi").unwrap();

    let mut pipeline = Pipeline::new();
    pipeline.push(tool_step("a", &input, &dir.join("tmp/a.nrrd")));
    pipeline.push(tool_step("b", &dir.join("tmp/a.nrrd"), &dir.join("tmp/b.nrrd")));
    pipeline.push(tool_step("c", &dir.join("tmp/b.nrrd"), &dir.join("c.nrrd")));
    pipeline.push(tool_step("d", &dir.join("tmp/a.nrrd"), &dir.join("d.nrrd")));
    Chain {
        _temp: temp,
        pipeline,
        dir,
    }
}

fn statuses(report: &shanoir_bids::pipeline::PipelineReport) -> Vec<&'static str> {
    report
        .steps
        .iter()
        .map(|step| match step.status {
            StepStatus::Completed => "completed",
            StepStatus::Failed { .. } => "failed",
            StepStatus::Skipped { .. } => "skipped",
        })
        .collect()
}

#[test]
fn all_steps_complete_and_create_parent_dirs() {
    let chain = chain();
    let tools = FakeTools::default();

    let report = chain.pipeline.run(&tools, FailurePolicy::FailFast);

    assert!(report.succeeded());
    assert_eq!(report.completed(), 4);
    assert!(chain.dir.join("tmp/b.nrrd").is_file());
    assert_eq!(*tools.calls.lock().unwrap(), vec!["a", "b", "c", "d"]);
}

#[test]
fn fail_fast_stops_the_chain() {
    let chain = chain();
    let tools = FakeTools {
        failing: vec!["b"],
        ..Default::default()
    };

    let report = chain.pipeline.run(&tools, FailurePolicy::FailFast);

    assert_eq!(statuses(&report), vec!["completed", "failed", "skipped", "skipped"]);
    assert_eq!(*tools.calls.lock().unwrap(), vec!["a", "b"]);
    assert_matches!(
        report.into_result(),
        Err(BidsError::StepFailed { step, .. }) if step == "b"
    );
}

#[test]
fn skip_policy_only_skips_dependents() {
    let chain = chain();
    let tools = FakeTools {
        failing: vec!["b"],
        ..Default::default()
    };

    let report = chain.pipeline.run(&tools, FailurePolicy::Skip);

    assert_eq!(statuses(&report), vec!["completed", "failed", "skipped", "completed"]);
    assert!(chain.dir.join("d.nrrd").is_file());
    assert!(!chain.dir.join("c.nrrd").exists());
}

#[test]
fn missing_output_fails_the_step() {
    let chain = chain();
    let tools = FakeTools {
        silent: vec!["a"],
        ..Default::default()
    };

    let report = chain.pipeline.run(&tools, FailurePolicy::FailFast);

    assert_matches!(
        &report.steps[0].status,
        StepStatus::Failed { message } if message.contains("did not produce")
    );
    assert!(!report.succeeded());
}

#[test]
fn missing_input_is_reported_before_running() {
    let temp = tempfile::tempdir().unwrap();
    let mut pipeline = Pipeline::new();
    pipeline.push(tool_step(
        "a",
        &temp.path().join("absent.nii.gz"),
        &temp.path().join("a.nrrd"),
    ));
    let tools = FakeTools::default();

    let report = pipeline.run(&tools, FailurePolicy::FailFast);

    assert!(tools.calls.lock().unwrap().is_empty());
    assert_matches!(
        &report.steps[0].status,
        StepStatus::Failed { message } if message.contains("missing input")
    );
}

#[test]
fn move_and_copy_steps() {
    let temp = tempfile::tempdir().unwrap();
    let source = temp.path().join("mask_tmp.nrrd");
    fs::write(&source, b"mask").unwrap();
    let bvec = temp.path().join("grad.bvec");
    fs::write(&bvec, b"0 0 1").unwrap();

    let mut pipeline = Pipeline::new();
    pipeline.push(Step::move_file(
        "store-mask",
        source.clone(),
        temp.path().join("out/mask.nrrd"),
    ));
    pipeline.push(Step::copy_file(
        "copy-bvec",
        bvec.clone(),
        temp.path().join("out/grad.bvec"),
    ));

    let report = pipeline.run(&FakeTools::default(), FailurePolicy::FailFast);

    assert!(report.succeeded());
    assert!(!source.exists());
    assert!(bvec.exists());
    assert_eq!(
        fs::read(temp.path().join("out/mask.nrrd")).unwrap(),
        b"mask"
    );
}
