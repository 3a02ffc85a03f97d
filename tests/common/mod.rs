#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use zephyr_runner::config::{AmbientEnv, OrchestratorSettings, ProjectSettings};
use zephyr_runner::console::MemoryConsole;
use zephyr_runner::core::CommandSpec;
use zephyr_runner::error::LaunchError;
use zephyr_runner::execution::{Launcher, StepOutcome, StepOutput};
use zephyr_runner::project::FsProjectContext;
use zephyr_runner::BuildOrchestrator;

/// What the spy does for one launch.
#[derive(Debug, Clone)]
pub enum Step {
    Exit { code: i32, output: Vec<String> },
    LaunchFailure,
    /// Prints `output`, then blocks until cancelled.
    Hang { output: Vec<String> },
}

impl Step {
    pub fn ok() -> Self {
        Step::Exit { code: 0, output: Vec::new() }
    }

    pub fn exit(code: i32, output: &[&str]) -> Self {
        Step::Exit {
            code,
            output: output.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Records every command it is asked to run and replays scripted steps.
/// Unscripted launches exit 0 without output.
#[derive(Default)]
pub struct SpyLauncher {
    calls: Mutex<Vec<CommandSpec>>,
    script: Mutex<VecDeque<Step>>,
}

impl SpyLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(steps: impl IntoIterator<Item = Step>) -> Self {
        let spy = Self::new();
        spy.script.lock().extend(steps);
        spy
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().clone()
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls().iter().map(|c| c.tool_name()).collect()
    }
}

#[async_trait]
impl Launcher for SpyLauncher {
    async fn launch(
        &self,
        spec: &CommandSpec,
        mut output: StepOutput,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, LaunchError> {
        self.calls.lock().push(spec.clone());
        let step = self.script.lock().pop_front().unwrap_or_else(Step::ok);

        match step {
            Step::Exit { code, output: lines } => {
                for line in lines {
                    output.accept(format!("{}\n", line).as_bytes());
                }
                Ok(StepOutcome::Exited { code: Some(code), output })
            }
            Step::LaunchFailure => Err(LaunchError::NotFound {
                program: spec.tool_name(),
            }),
            Step::Hang { output: lines } => {
                for line in lines {
                    output.accept(format!("{}\n", line).as_bytes());
                }
                cancel.cancelled().await;
                Ok(StepOutcome::Cancelled)
            }
        }
    }
}

pub fn project_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("CMakeLists.txt"),
        "cmake_minimum_required(VERSION 3.20.0)\nfind_package(Zephyr)\nproject(app)\n",
    )
    .unwrap();
    dir
}

pub fn mark_configured(project: &Path) {
    let build = project.join("build");
    std::fs::create_dir_all(&build).unwrap();
    std::fs::write(build.join(zephyr_runner::detection::CONFIGURED_STAMP), "configured\n").unwrap();
}

pub fn ambient(vars: &[(&str, &str)]) -> AmbientEnv {
    AmbientEnv::Fixed(
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
    )
}

pub struct Harness {
    pub orchestrator: BuildOrchestrator,
    pub launcher: Arc<SpyLauncher>,
    pub console: Arc<MemoryConsole>,
    pub context: Arc<FsProjectContext>,
}

pub fn harness(settings: ProjectSettings, launcher: SpyLauncher) -> Harness {
    harness_with(settings, launcher, OrchestratorSettings {
        ambient: ambient(&[]),
        ..OrchestratorSettings::default()
    })
}

pub fn harness_with(
    settings: ProjectSettings,
    launcher: SpyLauncher,
    orchestrator_settings: OrchestratorSettings,
) -> Harness {
    let launcher = Arc::new(launcher);
    let console = Arc::new(MemoryConsole::new());
    let context = Arc::new(FsProjectContext::new());
    let orchestrator = BuildOrchestrator::new(
        Arc::new(settings),
        context.clone(),
        launcher.clone(),
        console.clone(),
    )
    .with_settings(orchestrator_settings);

    Harness {
        orchestrator,
        launcher,
        console,
        context,
    }
}
