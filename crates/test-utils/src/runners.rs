#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use fovdag::config::model::StageParameters;
use fovdag::dataset::Dataset;
use fovdag::stage::{RunFuture, StageRegistry, StageRunner};
use fovdag::types::FragmentKey;

/// Registry key of [`ScriptedRunner`].
pub const SCRIPTED_STAGE_TYPE: &str = "scripted";

/// What a scripted stage does when one of its fragments runs.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// One `Whole` fragment instead of one per FOV.
    pub whole: bool,
    pub delay: Duration,
    /// Fail the first `n` attempts of a fragment.
    pub flaky: HashMap<FragmentKey, u32>,
    /// Fail every attempt.
    pub broken: BTreeSet<FragmentKey>,
    /// Outputs that already exist before the run.
    pub already_complete: BTreeSet<FragmentKey>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn whole(mut self) -> Self {
        self.whole = true;
        self
    }

    pub fn delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    pub fn flaky(mut self, fragment: FragmentKey, failures: u32) -> Self {
        self.flaky.insert(fragment, failures);
        self
    }

    pub fn broken(mut self, fragment: FragmentKey) -> Self {
        self.broken.insert(fragment);
        self
    }

    pub fn already_complete(mut self, fragment: FragmentKey) -> Self {
        self.already_complete.insert(fragment);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    Started,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub stage: String,
    pub fragment: FragmentKey,
    pub kind: TraceKind,
    pub at: Instant,
}

/// Ordered log of every fragment attempt across all scripted stages.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    events: Arc<Mutex<Vec<TraceEvent>>>,
}

impl Trace {
    fn push(&self, stage: &str, fragment: FragmentKey, kind: TraceKind) {
        self.events.lock().unwrap().push(TraceEvent {
            stage: stage.to_string(),
            fragment,
            kind,
            at: Instant::now(),
        });
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().unwrap().clone()
    }

    fn of_kind(&self, stage: &str, kind: TraceKind) -> Vec<TraceEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.stage == stage && e.kind == kind)
            .collect()
    }

    /// Fragments of `stage` in the order their attempts started.
    pub fn started(&self, stage: &str) -> Vec<FragmentKey> {
        self.of_kind(stage, TraceKind::Started)
            .into_iter()
            .map(|e| e.fragment)
            .collect()
    }

    pub fn start_count(&self, stage: &str) -> usize {
        self.of_kind(stage, TraceKind::Started).len()
    }

    pub fn attempts(&self, stage: &str, fragment: FragmentKey) -> usize {
        self.started(stage).into_iter().filter(|f| *f == fragment).count()
    }

    pub fn first_start(&self, stage: &str) -> Option<Instant> {
        self.of_kind(stage, TraceKind::Started).first().map(|e| e.at)
    }

    pub fn last_finish(&self, stage: &str) -> Option<Instant> {
        self.events()
            .into_iter()
            .filter(|e| e.stage == stage && e.kind != TraceKind::Started)
            .map(|e| e.at)
            .max()
    }

    /// Highest number of simultaneously running attempts, restricted to
    /// `stage` when given.
    pub fn max_concurrent(&self, stage: Option<&str>) -> usize {
        let mut running = 0usize;
        let mut max = 0usize;
        for event in self.events() {
            if stage.is_some_and(|s| s != event.stage) {
                continue;
            }
            match event.kind {
                TraceKind::Started => {
                    running += 1;
                    max = max.max(running);
                }
                TraceKind::Succeeded | TraceKind::Failed => running = running.saturating_sub(1),
            }
        }
        max
    }

    /// Whether some attempt of `a` overlapped some attempt of `b`.
    pub fn overlapped(&self, a: &str, b: &str) -> bool {
        let mut running: HashMap<String, usize> = HashMap::new();
        for event in self.events() {
            let count = running.entry(event.stage.clone()).or_default();
            match event.kind {
                TraceKind::Started => *count += 1,
                _ => *count = count.saturating_sub(1),
            }
            let a_running = running.get(a).copied().unwrap_or(0) > 0;
            let b_running = running.get(b).copied().unwrap_or(0) > 0;
            if a_running && b_running {
                return true;
            }
        }
        false
    }
}

/// Stage runner driven by a [`Script`], recording into a shared [`Trace`].
#[derive(Debug)]
pub struct ScriptedRunner {
    stage: String,
    script: Script,
    trace: Trace,
    attempts: Mutex<HashMap<FragmentKey, u32>>,
}

impl ScriptedRunner {
    pub fn new(stage: &str, script: Script, trace: Trace) -> Self {
        Self {
            stage: stage.to_string(),
            script,
            trace,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn should_fail(&self, fragment: FragmentKey) -> bool {
        let mut attempts = self.attempts.lock().unwrap();
        let attempt = attempts.entry(fragment).or_default();
        *attempt += 1;

        if self.script.broken.contains(&fragment) {
            return true;
        }
        let failures = self.script.flaky.get(&fragment).copied().unwrap_or(0);
        *attempt <= failures
    }
}

impl StageRunner for ScriptedRunner {
    fn fragment_keys(&self, dataset: &Dataset) -> Vec<FragmentKey> {
        if self.script.whole {
            vec![FragmentKey::Whole]
        } else {
            dataset.fov_fragments()
        }
    }

    fn run<'a>(&'a self, fragment: FragmentKey, _parameters: &'a StageParameters) -> RunFuture<'a> {
        Box::pin(async move {
            self.trace.push(&self.stage, fragment, TraceKind::Started);
            if !self.script.delay.is_zero() {
                tokio::time::sleep(self.script.delay).await;
            }

            if self.should_fail(fragment) {
                self.trace.push(&self.stage, fragment, TraceKind::Failed);
                return Err(anyhow!("{} {fragment}: scripted failure", self.stage));
            }
            self.trace.push(&self.stage, fragment, TraceKind::Succeeded);
            Ok(())
        })
    }

    fn is_already_complete(&self, fragment: FragmentKey) -> bool {
        self.script.already_complete.contains(&fragment)
    }
}

/// Scripts keyed by stage instance name, plus the trace they share.
#[derive(Debug, Clone, Default)]
pub struct ScriptedStages {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    trace: Trace,
}

impl ScriptedStages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages without a script run every fragment successfully at once.
    pub fn script(self, stage: &str, script: Script) -> Self {
        self.scripts.lock().unwrap().insert(stage.to_string(), script);
        self
    }

    pub fn trace(&self) -> Trace {
        self.trace.clone()
    }

    /// Registry with the built-ins plus the `scripted` stage type.
    pub fn registry(&self) -> StageRegistry {
        let mut registry = StageRegistry::with_builtins();
        let scripts = Arc::clone(&self.scripts);
        let trace = self.trace.clone();
        registry.register(SCRIPTED_STAGE_TYPE, move |instance, _ctx| {
            let script = scripts
                .lock()
                .unwrap()
                .get(&instance.name)
                .cloned()
                .unwrap_or_default();
            Ok(Arc::new(ScriptedRunner::new(&instance.name, script, trace.clone()))
                as Arc<dyn StageRunner>)
        });
        registry
    }
}
