mod common;

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use common::{CohortBuilder, cdip_regressor, stage_classifier, write_store};
use dipstat::data::Biomarker;
use tempfile::tempdir;

fn run_cli(dir: &Path, args: &[&str]) -> Output {
    let exe = env!("CARGO_BIN_EXE_dipstat");
    Command::new(exe)
        .current_dir(dir)
        .env("RUST_LOG", "warn")
        .args(args)
        .output()
        .expect("run dipstat cli")
}

#[test]
fn stage_command_writes_default_output() {
    let tmp = tempdir().expect("temporary directory");
    let models = tmp.path().join("models");
    write_store(&models, &stage_classifier(), &cdip_regressor());
    let input = tmp.path().join("cohort.tsv");
    CohortBuilder::new(20)
        .with_missing(Biomarker::Il6, &["3", "17"])
        .write_tsv(&input);

    let output = run_cli(
        tmp.path(),
        &[
            "stage",
            input.to_str().expect("path str"),
            "--models",
            models.to_str().expect("path str"),
        ],
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "CLI failed: {}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("2 record(s) excluded"), "{stdout}");
    assert!(stdout.contains("DIP1: 11"), "{stdout}");

    let written = fs::read_to_string(tmp.path().join("dip_predictions.tsv")).expect("output table");
    let mut lines = written.lines();
    assert_eq!(
        lines.next(),
        Some("ID\tTREM_1\tIL_6\tProcalcitonin\tDIP\tDIP1_Prob\tDIP2_Prob\tDIP3_Prob")
    );
    assert_eq!(lines.count(), 18);
}

#[test]
fn score_command_honours_output_path() {
    let tmp = tempdir().expect("temporary directory");
    let models = tmp.path().join("models");
    write_store(&models, &stage_classifier(), &cdip_regressor());
    let input = tmp.path().join("cohort.csv");
    let tsv = CohortBuilder::new(12).to_tsv();
    fs::write(&input, tsv.replace('\t', ",")).expect("write csv");
    let out_path = tmp.path().join("scores.tsv");

    let output = run_cli(
        tmp.path(),
        &[
            "score",
            input.to_str().expect("path str"),
            "--models",
            models.to_str().expect("path str"),
            "--output",
            out_path.to_str().expect("path str"),
        ],
    );

    assert!(output.status.success(), "CLI failed: {}", String::from_utf8_lossy(&output.stderr));
    let written = fs::read_to_string(&out_path).expect("output table");
    let mut lines = written.lines();
    assert_eq!(lines.next(), Some("ID\tTREM_1\tIL_6\tProcalcitonin\tcDIP"));
    for line in lines {
        let score: f64 = line.rsplit('\t').next().unwrap().parse().unwrap();
        assert!((0.0..=1.0).contains(&score), "{line}");
    }
}

#[test]
fn missing_column_exits_with_diagnostic() {
    let tmp = tempdir().expect("temporary directory");
    let input = tmp.path().join("broken.tsv");
    fs::write(&input, "ID\tTREM_1\tProcalcitonin\n1\t100\t0.5\n").expect("write input");

    let output = run_cli(tmp.path(), &["stage", input.to_str().expect("path str")]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error:"), "{stderr}");
    assert!(stderr.contains("IL_6"), "{stderr}");
    assert!(!tmp.path().join("dip_predictions.tsv").exists());
}

#[test]
fn inspect_prints_artifact_metadata() {
    let tmp = tempdir().expect("temporary directory");
    let models = tmp.path().join("models");
    write_store(&models, &stage_classifier(), &cdip_regressor());

    let output = run_cli(tmp.path(), &["inspect", "--models", models.to_str().expect("path str")]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Classifier: dip_forest"), "{stdout}");
    assert!(stdout.contains("Regressor: cdip_boost"), "{stdout}");
    assert!(stdout.contains("TREM_1, IL_6, Procalcitonin"), "{stdout}");
}

#[cfg(unix)]
#[test]
fn external_regressor_from_config() {
    let tmp = tempdir().expect("temporary directory");
    let models = tmp.path().join("models");
    write_store(&models, &stage_classifier(), &cdip_regressor());
    let input = tmp.path().join("cohort.tsv");
    CohortBuilder::new(6).write_tsv(&input);

    let config = tmp.path().join("dipstat.toml");
    fs::write(
        &config,
        r#"
[regressor]
kind = "external"
program = "/bin/sh"
args = ["-c", "awk 'NR > 1 { print 0.25 }'"]
timeout_secs = 30
"#,
    )
    .expect("write config");

    let output = run_cli(
        tmp.path(),
        &[
            "score",
            input.to_str().expect("path str"),
            "--config",
            config.to_str().expect("path str"),
            "--models",
            models.to_str().expect("path str"),
        ],
    );

    assert!(output.status.success(), "CLI failed: {}", String::from_utf8_lossy(&output.stderr));
    let written = fs::read_to_string(tmp.path().join("cdip_predictions.tsv")).expect("output table");
    let scores: Vec<&str> = written
        .lines()
        .skip(1)
        .map(|line| line.rsplit('\t').next().unwrap())
        .collect();
    assert_eq!(scores.len(), 6);
    assert!(scores.iter().all(|s| s.parse::<f64>().unwrap() == 0.25));
}

#[test]
fn version_prints_package_version() {
    let tmp = tempdir().expect("temporary directory");
    let output = run_cli(tmp.path(), &["version"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains(env!("CARGO_PKG_VERSION")));
}
