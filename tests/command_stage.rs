// tests/command_stage.rs
#![cfg(unix)]

mod common;
use crate::common::{init_tracing, with_timeout};

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use fovdag::cli::{CliArgs, Command, RunArgs};
use fovdag::run;
use tempfile::tempdir;

type TestResult = Result<(), Box<dyn Error>>;

fn write_pipeline(dir: &Path, decode_cmd: &str, sigma: u32) -> Result<PathBuf, Box<dyn Error>> {
    fs::create_dir_all(dir.join("run1"))?;
    let config = serde_json::json!({
        "execution": {
            "max_workers": 2,
            "max_attempts": 2,
            "retry_base_delay_ms": 1,
            "retry_max_delay_ms": 5
        },
        "dataset": { "root": "run1", "fov_count": 3 },
        "analysis_tasks": [
            { "task": "Preprocess", "module": "command",
              "parameters": {
                  "cmd": "mkdir -p pre && echo {fov} {highpass_sigma} > pre/{fov}.txt",
                  "output": "pre/{fov}.txt",
                  "highpass_sigma": sigma } },
            { "task": "Decode", "module": "command",
              "parameters": { "cmd": decode_cmd, "preprocess_task": "Preprocess" } },
            { "task": "Summarize", "module": "command",
              "parameters": {
                  "cmd": "cat pre/*.txt > summary.txt",
                  "per_fov": false,
                  "decode_task": "Decode" } }
        ]
    });
    let path = dir.join("pipeline.json");
    fs::write(&path, serde_json::to_string_pretty(&config)?)?;
    Ok(path)
}

fn args(config: &Path, command: Command) -> CliArgs {
    CliArgs {
        config: config.to_path_buf(),
        log_level: None,
        command,
    }
}

#[tokio::test]
async fn shell_commands_run_per_fov_then_as_a_whole() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let config = write_pipeline(dir.path(), "test -f pre/{fov}.txt", 3)?;

    let ok = with_timeout(run(args(&config, Command::Run(RunArgs { max_workers: None })))).await?;
    assert!(ok);

    let summary = fs::read_to_string(dir.path().join("run1/summary.txt"))?;
    let mut lines: Vec<&str> = summary.lines().collect();
    lines.sort_unstable();
    assert_eq!(lines, vec!["0 3", "1 3", "2 3"]);
    Ok(())
}

#[tokio::test]
async fn failing_command_fails_the_run_and_skips_downstream() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let config = write_pipeline(dir.path(), "test {fov} -ne 1", 3)?;

    let ok = with_timeout(run(args(&config, Command::Run(RunArgs { max_workers: None })))).await?;
    assert!(!ok);
    assert!(dir.path().join("run1/pre/2.txt").exists());
    assert!(!dir.path().join("run1/summary.txt").exists());
    Ok(())
}

#[tokio::test]
async fn resume_after_a_parameter_change_rewrites_existing_outputs() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let config = write_pipeline(dir.path(), "test -f pre/{fov}.txt", 3)?;
    assert!(with_timeout(run(args(&config, Command::Run(RunArgs { max_workers: None })))).await?);

    // Same outputs on disk, new sigma.
    let config = write_pipeline(dir.path(), "test -f pre/{fov}.txt", 5)?;
    let resumed =
        with_timeout(run(args(&config, Command::Resume(RunArgs { max_workers: None })))).await?;
    assert!(resumed);

    let summary = fs::read_to_string(dir.path().join("run1/summary.txt"))?;
    let mut lines: Vec<&str> = summary.lines().collect();
    lines.sort_unstable();
    assert_eq!(lines, vec!["0 5", "1 5", "2 5"]);
    Ok(())
}
