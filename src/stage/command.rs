// src/stage/command.rs

//! Built-in runner executing a shell command per fragment.
//!
//! ```json
//! { "task": "Preprocess", "module": "command",
//!   "parameters": {
//!     "cmd": "preprocess --fov {fov} --sigma {highpass_sigma}",
//!     "output": "preprocessed/fov_{fov}.tif",
//!     "highpass_sigma": 3 } }
//! ```
//!
//! Placeholders: `{fov}` (per-FOV stages only), `{fragment}`, `{stage}`,
//! `{root}`, `{dataset}` and any parameter name. Reference parameters render
//! as the referenced stage's name.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock};

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::model::{ParameterValue, StageInstance, StageParameters};
use crate::dataset::Dataset;
use crate::fs::FileSystem;
use crate::stage::{PipelineContext, RunFuture, StageRunner};
use crate::types::FragmentKey;

/// Registry key of the command runner.
pub const COMMAND_STAGE_TYPE: &str = "command";

const BUILTIN_PLACEHOLDERS: &[&str] = &["fov", "fragment", "stage", "root", "dataset"];

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder regex"));

#[derive(Debug)]
pub struct CommandStage {
    stage: String,
    cmd: String,
    per_fov: bool,
    output: Option<String>,
    /// Parameters the `output` template renders against.
    params: StageParameters,
    workdir: PathBuf,
    dataset_root: PathBuf,
    dataset_name: String,
    estimated_memory_mb: Option<u64>,
    estimated_minutes: Option<u64>,
    fs: Arc<dyn FileSystem>,
}

impl CommandStage {
    /// Validate the instance's parameters and build the runner.
    pub fn from_instance(instance: &StageInstance, ctx: &PipelineContext) -> Result<Self> {
        let params = &instance.parameters;

        let cmd = params
            .get_str("cmd")
            .ok_or_else(|| anyhow!("missing string parameter `cmd`"))?
            .to_string();

        let per_fov = match params.get("per_fov") {
            None => true,
            Some(_) => params
                .get_bool("per_fov")
                .ok_or_else(|| anyhow!("`per_fov` must be a boolean"))?,
        };

        let output = params.get_str("output").map(str::to_string);

        let workdir = match params.get_str("workdir") {
            Some(dir) => ctx.base_dir.join(dir),
            None => ctx.dataset.root().to_path_buf(),
        };

        for template in std::iter::once(&cmd).chain(output.iter()) {
            check_placeholders(template, params, per_fov)?;
        }

        let estimate = |name: &str| match params.get(name) {
            Some(ParameterValue::Literal(v)) => v.as_u64(),
            _ => None,
        };

        Ok(Self {
            stage: instance.name.clone(),
            cmd,
            per_fov,
            output,
            params: params.clone(),
            workdir,
            dataset_root: ctx.dataset.root().to_path_buf(),
            dataset_name: ctx.dataset.name().to_string(),
            estimated_memory_mb: estimate("estimated_memory_mb"),
            estimated_minutes: estimate("estimated_minutes"),
            fs: Arc::clone(&ctx.fs),
        })
    }

    /// Substitute placeholders for one fragment.
    pub fn render(&self, template: &str, fragment: FragmentKey, params: &StageParameters) -> String {
        PLACEHOLDER
            .replace_all(template, |caps: &regex::Captures<'_>| {
                let name = &caps[1];
                match name {
                    "fov" => match fragment {
                        FragmentKey::Fov(id) => id.to_string(),
                        FragmentKey::Whole => String::new(),
                    },
                    "fragment" => fragment.to_string(),
                    "stage" => self.stage.clone(),
                    "root" => self.dataset_root.display().to_string(),
                    "dataset" => self.dataset_name.clone(),
                    other => match params.get(other) {
                        Some(ParameterValue::Literal(serde_json::Value::String(s))) => s.clone(),
                        Some(value) => match value.to_json() {
                            serde_json::Value::String(s) => s,
                            v => v.to_string(),
                        },
                        None => caps[0].to_string(),
                    },
                }
            })
            .into_owned()
    }

    fn output_path(&self, fragment: FragmentKey) -> Option<PathBuf> {
        let output = self.output.as_ref()?;
        let rendered = self.render(output, fragment, &self.params);
        let path = Path::new(&rendered);
        Some(if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workdir.join(path)
        })
    }

    async fn run_command(&self, fragment: FragmentKey, params: &StageParameters) -> Result<()> {
        let rendered = self.render(&self.cmd, fragment, params);

        info!(
            stage = %self.stage,
            fragment = %fragment,
            cmd = %rendered,
            "starting fragment command"
        );

        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(&rendered);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(&rendered);
            c
        };

        cmd.current_dir(&self.workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning command for stage '{}' {}", self.stage, fragment))?;

        // Always consume both pipes so buffers don't fill; log at debug.
        if let Some(stdout) = child.stdout.take() {
            spawn_line_logger(stdout, self.stage.clone(), fragment, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_logger(stderr, self.stage.clone(), fragment, "stderr");
        }

        let status = child
            .wait()
            .await
            .with_context(|| format!("waiting for command of stage '{}' {}", self.stage, fragment))?;

        if !status.success() {
            bail!(
                "command exited with code {}",
                status.code().map_or_else(|| "none".to_string(), |c| c.to_string())
            );
        }
        Ok(())
    }
}

fn spawn_line_logger<R>(reader: R, stage: String, fragment: FragmentKey, stream: &'static str)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(stage = %stage, fragment = %fragment, "{stream}: {line}");
        }
    });
}

fn check_placeholders(template: &str, params: &StageParameters, per_fov: bool) -> Result<()> {
    for caps in PLACEHOLDER.captures_iter(template) {
        let name = &caps[1];
        if name == "fov" && !per_fov {
            bail!("`{{fov}}` used in a stage with `per_fov = false`");
        }
        if !BUILTIN_PLACEHOLDERS.contains(&name) && params.get(name).is_none() {
            bail!("unknown placeholder `{{{name}}}` in template {template:?}");
        }
    }
    Ok(())
}

impl StageRunner for CommandStage {
    fn fragment_keys(&self, dataset: &Dataset) -> Vec<FragmentKey> {
        if self.per_fov {
            dataset.fov_fragments()
        } else {
            vec![FragmentKey::Whole]
        }
    }

    fn run<'a>(&'a self, fragment: FragmentKey, parameters: &'a StageParameters) -> RunFuture<'a> {
        Box::pin(self.run_command(fragment, parameters))
    }

    fn is_already_complete(&self, fragment: FragmentKey) -> bool {
        self.output_path(fragment)
            .is_some_and(|path| self.fs.exists(&path))
    }

    fn estimated_memory_mb(&self) -> Option<u64> {
        self.estimated_memory_mb
    }

    fn estimated_minutes(&self) -> Option<u64> {
        self.estimated_minutes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn instance(params: serde_json::Value, refs: &[(&str, &str)]) -> StageInstance {
        let mut values: BTreeMap<String, ParameterValue> = serde_json::from_value::<
            BTreeMap<String, serde_json::Value>,
        >(params)
        .unwrap()
        .into_iter()
        .map(|(k, v)| (k, ParameterValue::Literal(v)))
        .collect();
        for (k, v) in refs {
            values.insert(k.to_string(), ParameterValue::Reference(v.to_string()));
        }
        StageInstance {
            name: "Decode".to_string(),
            stage_type: "Decode".to_string(),
            module: Some("command".to_string()),
            parameters: StageParameters::new(values),
            run_after: Vec::new(),
            max_parallel: None,
        }
    }

    fn ctx(fs: &MockFileSystem) -> PipelineContext {
        PipelineContext {
            dataset: Arc::new(Dataset::new("run1", "/data/run1", vec![0, 1])),
            base_dir: PathBuf::from("/configs"),
            fs: Arc::new(fs.clone()),
        }
    }

    #[test]
    fn renders_builtins_parameters_and_references() {
        let fs = MockFileSystem::new();
        let inst = instance(
            json!({ "cmd": "decode --fov {fov} --in {preprocess_task} --area {min_area} --ds {dataset}", "min_area": 4 }),
            &[("preprocess_task", "Preprocess")],
        );
        let stage = CommandStage::from_instance(&inst, &ctx(&fs)).unwrap();

        let rendered = stage.render(&stage.cmd, FragmentKey::Fov(7), &inst.parameters);
        assert_eq!(rendered, "decode --fov 7 --in Preprocess --area 4 --ds run1");
    }

    #[test]
    fn rejects_missing_cmd_and_unknown_placeholders() {
        let fs = MockFileSystem::new();
        let err = CommandStage::from_instance(&instance(json!({}), &[]), &ctx(&fs)).unwrap_err();
        assert!(err.to_string().contains("cmd"));

        let err = CommandStage::from_instance(&instance(json!({ "cmd": "x {nope}" }), &[]), &ctx(&fs))
            .unwrap_err();
        assert!(err.to_string().contains("nope"));

        let err = CommandStage::from_instance(
            &instance(json!({ "cmd": "x {fov}", "per_fov": false }), &[]),
            &ctx(&fs),
        )
        .unwrap_err();
        assert!(err.to_string().contains("per_fov"));
    }

    #[test]
    fn whole_dataset_stage_has_one_fragment() {
        let fs = MockFileSystem::new();
        let c = ctx(&fs);
        let stage = CommandStage::from_instance(
            &instance(json!({ "cmd": "export", "per_fov": false }), &[]),
            &c,
        )
        .unwrap();
        assert_eq!(stage.fragment_keys(&c.dataset), vec![FragmentKey::Whole]);

        let per_fov = CommandStage::from_instance(&instance(json!({ "cmd": "x" }), &[]), &c).unwrap();
        assert_eq!(per_fov.fragment_keys(&c.dataset).len(), 2);
    }

    #[test]
    fn existing_output_means_already_complete() {
        let fs = MockFileSystem::new();
        fs.add_file("/data/run1/decoded_v2/fov_1.csv", "barcode,x,y\n");
        let stage = CommandStage::from_instance(
            &instance(
                json!({ "cmd": "x", "output": "decoded_{version}/fov_{fov}.csv", "version": "v2" }),
                &[],
            ),
            &ctx(&fs),
        )
        .unwrap();

        assert!(stage.is_already_complete(FragmentKey::Fov(1)));
        assert!(!stage.is_already_complete(FragmentKey::Fov(0)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_a_fragment_failure() {
        let dir = tempfile::tempdir().unwrap();
        let c = PipelineContext {
            dataset: Arc::new(Dataset::new("t", dir.path(), vec![0])),
            base_dir: dir.path().to_path_buf(),
            fs: Arc::new(crate::fs::RealFileSystem),
        };

        let ok = instance(json!({ "cmd": "echo {fragment} > out_{fov}.txt" }), &[]);
        let stage = CommandStage::from_instance(&ok, &c).unwrap();
        stage.run(FragmentKey::Fov(0), &ok.parameters).await.unwrap();
        let written = std::fs::read_to_string(dir.path().join("out_0.txt")).unwrap();
        assert_eq!(written.trim(), "fov:0");

        let failing = instance(json!({ "cmd": "exit 3" }), &[]);
        let stage = CommandStage::from_instance(&failing, &c).unwrap();
        let err = stage.run(FragmentKey::Fov(0), &failing.parameters).await.unwrap_err();
        assert!(err.to_string().contains("code 3"));
    }
}
