use std::fs;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use shanoir_bids::domain::{DatasetRecord, PrefixSubstitution, SequenceSpec};
use shanoir_bids::error::BidsError;
use shanoir_bids::layout::BidsLayout;
use shanoir_bids::reconcile::{PendingRuns, ReconcileOutcome, Reconciler, RunState};

struct Fixture {
    _temp: tempfile::TempDir,
    layout: BidsLayout,
    incoming: Utf8PathBuf,
}

fn fixture() -> Fixture {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("data")).unwrap();
    let incoming = Utf8PathBuf::from_path_buf(temp.path().join("incoming")).unwrap();
    fs::create_dir_all(incoming.as_std_path()).unwrap();
    Fixture {
        _temp: temp,
        layout: BidsLayout::new(root),
        incoming,
    }
}

fn download(dir: &Utf8Path, name: &str, content: &str) -> Utf8PathBuf {
    let path = dir.join(name);
    fs::write(path.as_std_path(), content).unwrap();
    path
}

fn t1w() -> SequenceSpec {
    SequenceSpec {
        dataset_name: "T1 MPRAGE".to_string(),
        modality_dir: "anat".to_string(),
        label: "t1w".to_string(),
    }
}

fn record(id: &str, subject: &str, dataset: &str) -> DatasetRecord {
    DatasetRecord {
        id: id.to_string(),
        subject_name: subject.to_string(),
        dataset_name: dataset.to_string(),
    }
}

fn listing(dir: &Utf8Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir.as_std_path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

#[test]
fn first_archive_has_no_run_suffix() {
    let fx = fixture();
    let reconciler = Reconciler::new(&fx.layout, &[]);
    let archive = download(&fx.incoming, "101_T1.zip", "a");

    let outcome = reconciler
        .place(&archive, &record("101", "sub-1", "T1 MPRAGE"), &t1w())
        .unwrap();

    let expected = fx.layout.root().join("sub-1/anat/sub-1_t1w.zip");
    assert_eq!(
        outcome,
        ReconcileOutcome::Placed {
            path: expected.clone(),
            run: None,
            renamed: Vec::new(),
        }
    );
    assert!(expected.as_std_path().is_file());
    assert!(!archive.as_std_path().exists());
}

#[test]
fn second_archive_renames_the_first_to_run_one() {
    let fx = fixture();
    let reconciler = Reconciler::new(&fx.layout, &[]);
    let seq = t1w();

    let first = download(&fx.incoming, "101.zip", "first");
    reconciler
        .place(&first, &record("101", "sub-1", "T1 MPRAGE"), &seq)
        .unwrap();
    let second = download(&fx.incoming, "102.zip", "second");
    let outcome = reconciler
        .place(&second, &record("102", "sub-1", "T1 MPRAGE"), &seq)
        .unwrap();

    let dir = fx.layout.root().join("sub-1/anat");
    assert_matches!(
        outcome,
        ReconcileOutcome::Placed { run: Some(2), ref renamed, .. }
            if renamed.len() == 1
                && renamed[0].from == dir.join("sub-1_t1w.zip")
                && renamed[0].to == dir.join("sub-1_t1w_run-1.zip")
    );
    assert_eq!(listing(&dir), vec!["sub-1_t1w_run-1.zip", "sub-1_t1w_run-2.zip"]);
    assert_eq!(
        fs::read_to_string(dir.join("sub-1_t1w_run-1.zip").as_std_path()).unwrap(),
        "first"
    );
}

#[test]
fn third_archive_appends_run_three() {
    let fx = fixture();
    let reconciler = Reconciler::new(&fx.layout, &[]);
    let seq = t1w();
    for (id, content) in [("101", "a"), ("102", "b"), ("103", "c")] {
        let archive = download(&fx.incoming, &format!("{id}.zip"), content);
        reconciler
            .place(&archive, &record(id, "sub-1", "T1 MPRAGE"), &seq)
            .unwrap();
    }

    let dir = fx.layout.root().join("sub-1/anat");
    assert_eq!(
        listing(&dir),
        vec![
            "sub-1_t1w_run-1.zip",
            "sub-1_t1w_run-2.zip",
            "sub-1_t1w_run-3.zip"
        ]
    );
    assert_eq!(
        fs::read_to_string(dir.join("sub-1_t1w_run-2.zip").as_std_path()).unwrap(),
        "b"
    );
}

#[test]
fn existing_runs_are_left_untouched() {
    let fx = fixture();
    let dir = fx.layout.root().join("sub-1/anat");
    fs::create_dir_all(dir.as_std_path()).unwrap();
    for n in 1..=4 {
        download(&dir, &format!("sub-1_t1w_run-{n}.zip"), &format!("run{n}"));
    }

    let reconciler = Reconciler::new(&fx.layout, &[]);
    let archive = download(&fx.incoming, "105.zip", "new");
    let outcome = reconciler
        .place(&archive, &record("105", "sub-1", "T1 MPRAGE"), &t1w())
        .unwrap();

    assert_matches!(
        outcome,
        ReconcileOutcome::Placed { run: Some(5), ref renamed, .. } if renamed.is_empty()
    );
    for n in 1..=4 {
        assert_eq!(
            fs::read_to_string(dir.join(format!("sub-1_t1w_run-{n}.zip")).as_std_path()).unwrap(),
            format!("run{n}")
        );
    }
}

#[test]
fn name_mismatch_moves_nothing() {
    let fx = fixture();
    let reconciler = Reconciler::new(&fx.layout, &[]);
    let archive = download(&fx.incoming, "201.zip", "dwi");

    let outcome = reconciler
        .place(&archive, &record("201", "sub-1", "DWI SENSE"), &t1w())
        .unwrap();

    assert_matches!(outcome, ReconcileOutcome::NameMismatch { .. });
    assert!(archive.as_std_path().exists());
    assert!(!fx.layout.root().join("sub-1").as_std_path().exists());
}

#[test]
fn name_comparison_ignores_case() {
    let fx = fixture();
    let reconciler = Reconciler::new(&fx.layout, &[]);
    let archive = download(&fx.incoming, "301.zip", "t1");

    let outcome = reconciler
        .place(&archive, &record("301", "sub-1", "t1 mprage"), &t1w())
        .unwrap();
    assert_matches!(outcome, ReconcileOutcome::Placed { run: None, .. });
}

#[test]
fn subject_directory_uses_prefix_substitution() {
    let fx = fixture();
    let subs = vec![PrefixSubstitution {
        from: "LONGIDEP".to_string(),
        to: "lgp".to_string(),
    }];
    let reconciler = Reconciler::new(&fx.layout, &subs);
    let seq = SequenceSpec {
        dataset_name: "DWI SENSE".to_string(),
        modality_dir: "diffusion".to_string(),
        label: String::new(),
    };
    let archive = download(&fx.incoming, "401.zip", "dwi");

    reconciler
        .place(&archive, &record("401", "LONGIDEP 146 CV", "DWI SENSE"), &seq)
        .unwrap();
    assert!(
        fx.layout
            .root()
            .join("lgp_146_CV/diffusion/lgp_146_CV.zip")
            .as_std_path()
            .is_file()
    );
}

#[test]
fn gap_in_run_numbers_is_reported_as_collision() {
    let fx = fixture();
    let dir = fx.layout.root().join("sub-1/anat");
    fs::create_dir_all(dir.as_std_path()).unwrap();
    download(&dir, "sub-1_t1w_run-2.zip", "kept");

    let reconciler = Reconciler::new(&fx.layout, &[]);
    let archive = download(&fx.incoming, "501.zip", "new");
    let err = reconciler
        .place(&archive, &record("501", "sub-1", "T1 MPRAGE"), &t1w())
        .unwrap_err();

    assert_matches!(err, BidsError::RunCollision(_));
    assert!(archive.as_std_path().exists());
    assert_eq!(
        fs::read_to_string(dir.join("sub-1_t1w_run-2.zip").as_std_path()).unwrap(),
        "kept"
    );
}

#[test]
fn preview_does_not_touch_the_filesystem() {
    let fx = fixture();
    let reconciler = Reconciler::new(&fx.layout, &[]);
    let mut pending = PendingRuns::default();
    let plan = reconciler
        .preview("zip", &record("601", "sub-2", "T1 MPRAGE"), &t1w(), &mut pending)
        .unwrap()
        .unwrap();
    assert_eq!(plan.destination, fx.layout.root().join("sub-2/anat/sub-2_t1w.zip"));
    assert!(!fx.layout.root().as_std_path().exists());
    assert_eq!(
        RunState::scan(&fx.layout.root().join("sub-2/anat"), "sub-2_t1w", "zip").unwrap(),
        RunState::Empty
    );
}

#[test]
fn previews_number_runs_after_earlier_previews() {
    let fx = fixture();
    let dir = fx.layout.root().join("sub-1/anat");
    fs::create_dir_all(dir.as_std_path()).unwrap();
    download(&dir, "sub-1_t1w.zip", "existing");

    let reconciler = Reconciler::new(&fx.layout, &[]);
    let mut pending = PendingRuns::default();
    let plans: Vec<_> = ["701", "702"]
        .iter()
        .map(|id| {
            reconciler
                .preview("zip", &record(id, "sub-1", "T1 MPRAGE"), &t1w(), &mut pending)
                .unwrap()
                .unwrap()
        })
        .collect();

    assert_eq!(plans[0].destination, dir.join("sub-1_t1w_run-2.zip"));
    assert_eq!(
        plans[0].renames,
        vec![(dir.join("sub-1_t1w.zip"), dir.join("sub-1_t1w_run-1.zip"))]
    );
    assert_eq!(plans[1].destination, dir.join("sub-1_t1w_run-3.zip"));
    assert!(plans[1].renames.is_empty());
    assert_eq!(listing(&dir), vec!["sub-1_t1w.zip"]);
}

#[test]
fn placed_outcome_serializes_paths() {
    let fx = fixture();
    let reconciler = Reconciler::new(&fx.layout, &[]);
    let seq = t1w();
    let first = download(&fx.incoming, "801.zip", "a");
    reconciler
        .place(&first, &record("801", "sub-3", "T1 MPRAGE"), &seq)
        .unwrap();
    let second = download(&fx.incoming, "802.zip", "b");
    let outcome = reconciler
        .place(&second, &record("802", "sub-3", "T1 MPRAGE"), &seq)
        .unwrap();

    let dir = fx.layout.root().join("sub-3/anat");
    let value = serde_json::to_value(&outcome).unwrap();
    assert_eq!(value["outcome"], "placed");
    assert_eq!(value["path"], dir.join("sub-3_t1w_run-2.zip").as_str());
    assert_eq!(value["run"], 2);
    assert_eq!(value["renamed"][0]["from"], dir.join("sub-3_t1w.zip").as_str());
    assert_eq!(value["renamed"][0]["to"], dir.join("sub-3_t1w_run-1.zip").as_str());
}
