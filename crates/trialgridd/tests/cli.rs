//! End-to-end runs of the `trialgridd` binary.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;

const CONFIG: &str = r#"
[pool]
core_size = 2
max_size = 4

[retention]
ttl_secs = 0

[dry_run]
stage_secs = 0
window_secs = 0
"#;

const TRIALS: &str = r#"[
  {
    "id": "api-0",
    "deployment": { "namespace": "default", "name": "api" },
    "config": {
      "experiment_name": "api-sizing",
      "trial_number": 0,
      "container": "app",
      "resources": { "cpu_request": 1.0, "memory_request_mib": 256 }
    }
  },
  {
    "id": "api-1",
    "deployment": { "namespace": "default", "name": "api" },
    "config": {
      "experiment_name": "api-sizing",
      "trial_number": 1,
      "container": "app",
      "resources": { "cpu_request": 2.0, "memory_request_mib": 512 }
    }
  },
  {
    "id": "web-0",
    "deployment": { "namespace": "default", "name": "web" },
    "config": {
      "experiment_name": "web-sizing",
      "trial_number": 0,
      "container": "nginx"
    }
  },
  {
    "id": "web-0",
    "deployment": { "namespace": "default", "name": "web" },
    "config": {
      "experiment_name": "web-sizing",
      "trial_number": 0,
      "container": "nginx"
    }
  }
]"#;

fn write_file(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path
}

fn trialgridd(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_trialgridd"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap()
}

#[test]
fn run_prints_summary_of_finished_trials() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_file(dir.path(), "trialgrid.toml", CONFIG);
    let trials = write_file(dir.path(), "trials.json", TRIALS);

    let output = trialgridd(&[
        "run",
        "--config",
        config.to_str().unwrap(),
        "--trials",
        trials.to_str().unwrap(),
        "--timeout-secs",
        "60",
    ]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let summary: Vec<Value> = serde_json::from_slice(&output.stdout).unwrap();
    // The duplicate submission is rejected, not summarized twice.
    assert_eq!(summary.len(), 3);
    for trial in &summary {
        assert_eq!(trial["status"], "COMPLETED", "{trial}");
        assert_eq!(trial["stage"], "complete", "{trial}");
    }

    let api_1 = summary.iter().find(|t| t["id"] == "api-1").unwrap();
    assert_eq!(api_1["deployment"], "default:api");
    assert_eq!(api_1["metrics"]["response_time_ms"], 100.0);

    let web_0 = summary.iter().find(|t| t["id"] == "web-0").unwrap();
    assert!(web_0["metrics"].as_object().unwrap().is_empty());
}

#[test]
fn run_without_trials_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.json");

    let output = trialgridd(&["run", "--trials", missing.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to read trials file"));
}

#[test]
fn check_config_prints_effective_settings() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_file(dir.path(), "trialgrid.toml", CONFIG);

    let output = trialgridd(&["check-config", "--config", config.to_str().unwrap()]);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("core_size = 2"));
    assert!(stdout.contains("[scheduled_pool]"));
}

#[test]
fn check_config_rejects_invalid_pool() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_file(dir.path(), "bad.toml", "[pool]\ncore_size = 8\nmax_size = 2\n");

    let output = trialgridd(&["check-config", "--config", config.to_str().unwrap()]);
    assert!(!output.status.success());
}
