use crate::config::{OrchestratorSettings, ProjectConfigSource};
use crate::console::ConsoleSink;
use crate::core::{compose_environment, BuildKind, BuildRequest, BuildResult, CommandSpec};
use crate::detection;
use crate::diagnostics::ErrorParserRegistry;
use crate::error::BuildError;
use crate::execution::{Launcher, StepOutcome, StepOutput};
use crate::project::ProjectContext;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// Does not serialize invocations; callers keep one build per build directory
// at a time (see JobManager).
pub struct BuildOrchestrator {
    settings: OrchestratorSettings,
    project: Arc<dyn ProjectConfigSource>,
    context: Arc<dyn ProjectContext>,
    launcher: Arc<dyn Launcher>,
    parsers: Arc<ErrorParserRegistry>,
    console: Arc<dyn ConsoleSink>,
}

impl BuildOrchestrator {
    pub fn new(
        project: Arc<dyn ProjectConfigSource>,
        context: Arc<dyn ProjectContext>,
        launcher: Arc<dyn Launcher>,
        console: Arc<dyn ConsoleSink>,
    ) -> Self {
        Self {
            settings: OrchestratorSettings::default(),
            project,
            context,
            launcher,
            parsers: Arc::new(ErrorParserRegistry::default()),
            console,
        }
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_parsers(mut self, parsers: Arc<ErrorParserRegistry>) -> Self {
        self.parsers = parsers;
        self
    }

    pub async fn build(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<BuildResult, BuildError> {
        validate(request).await?;

        let scope = request.project_root();
        let build_dir = request.build_directory();
        let policy = self.settings.marker;
        self.context.clear_diagnostics(scope);

        fs::create_dir_all(build_dir)
            .await
            .map_err(|source| BuildError::BuildDirectory {
                path: build_dir.to_path_buf(),
                source,
            })?;

        self.announce(&format!(
            "Building Zephyr application {} for board {}",
            request.project_name(),
            request.target_id()
        ));

        let environment = self.environment(request);
        let search_paths = self.search_paths();
        let generator = self.project.generator();

        let needs_configure = request.build_kind() == BuildKind::Full
            || !self.context.is_configured(build_dir, policy).await;

        if needs_configure {
            detection::clear_configured(build_dir, policy)
                .await
                .map_err(|source| BuildError::BuildDirectory {
                    path: build_dir.to_path_buf(),
                    source,
                })?;

            let program =
                detection::resolve_executable(&self.settings.configure_tool, &search_paths).await;
            let mut spec = CommandSpec::new(program, build_dir);
            for arg in generator.cmake_args() {
                spec = spec.arg(*arg);
            }
            let spec = spec
                .arg(format!("-DBOARD={}", request.target_id()))
                .arg(scope.as_os_str())
                .environment(environment.clone());

            let output = StepOutput::console_only(self.console.clone());
            match self.run_step(&spec, output, cancel).await? {
                StepOutcome::Cancelled => return Err(BuildError::Cancelled),
                StepOutcome::Exited { code: Some(0), .. } => {
                    if let Err(e) = detection::mark_configured(build_dir, policy).await {
                        warn!("Could not record configuration of {:?}: {}", build_dir, e);
                    }
                }
                StepOutcome::Exited { code, .. } => {
                    let reason = exit_reason(&spec, code);
                    warn!("Configuration failed, skipping build: {}", reason);
                    self.announce(&reason);
                    return Ok(BuildResult {
                        configured: true,
                        exit_code: code,
                        ..BuildResult::failure(reason)
                    });
                }
            }
        } else {
            info!("{:?} already configured, skipping {}", build_dir, self.settings.configure_tool);
        }

        let program = detection::resolve_executable(generator.build_tool(), &search_paths).await;
        let spec = CommandSpec::new(program, build_dir).environment(environment);

        let toolchain = self.project.toolchain_id();
        let output = StepOutput::parsed(self.console.clone(), self.parsers.create(&toolchain));
        let (code, output) = match self.run_step(&spec, output, cancel).await? {
            StepOutcome::Cancelled => return Err(BuildError::Cancelled),
            StepOutcome::Exited { code, output } => (code, output),
        };

        let diagnostics: Vec<_> = output
            .into_diagnostics()
            .into_iter()
            .map(|mut d| {
                d.file = d.file.map(|f| self.context.resolve_path(build_dir, &f));
                d
            })
            .collect();
        self.context.record_diagnostics(scope, diagnostics.clone());
        self.refresh(scope).await;

        let succeeded = code == Some(0);
        info!(
            "Build of {} finished: succeeded={}, {} diagnostic(s)",
            request.project_name(),
            succeeded,
            diagnostics.len()
        );

        Ok(BuildResult {
            succeeded,
            failure_reason: (!succeeded).then(|| exit_reason(&spec, code)),
            diagnostics,
            configured: needs_configure,
            exit_code: code,
        })
    }

    pub async fn clean(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<BuildResult, BuildError> {
        validate(request).await?;

        let scope = request.project_root();
        let build_dir = request.build_directory();
        self.context.clear_diagnostics(scope);

        if !self.context.is_configured(build_dir, self.settings.marker).await {
            info!("{:?} was never configured, nothing to clean", build_dir);
            return Ok(BuildResult::success());
        }

        self.announce(&format!(
            "Cleaning Zephyr application {} for board {}",
            request.project_name(),
            request.target_id()
        ));

        let program =
            detection::resolve_executable(self.project.generator().build_tool(), &self.search_paths())
                .await;
        let spec = CommandSpec::new(program, build_dir)
            .arg("clean")
            .environment(self.environment(request));

        let output = StepOutput::console_only(self.console.clone());
        let code = match self.run_step(&spec, output, cancel).await? {
            StepOutcome::Cancelled => return Err(BuildError::Cancelled),
            StepOutcome::Exited { code, .. } => code,
        };
        self.refresh(scope).await;

        let succeeded = code == Some(0);
        Ok(BuildResult {
            succeeded,
            failure_reason: (!succeeded).then(|| exit_reason(&spec, code)),
            exit_code: code,
            ..BuildResult::success()
        })
    }

    pub fn environment(&self, request: &BuildRequest) -> BTreeMap<String, String> {
        compose_environment(
            &self.settings.ambient.snapshot(),
            &self.project.build_environment(),
            request.environment(),
        )
    }

    fn search_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.project.tool_paths();
        paths.extend(self.settings.search_paths.iter().cloned());
        paths
    }

    async fn run_step(
        &self,
        spec: &CommandSpec,
        output: StepOutput,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, BuildError> {
        info!("Running {}", spec);
        self.announce(&spec.to_string());
        Ok(self.launcher.launch(spec, output, cancel).await?)
    }

    async fn refresh(&self, path: &Path) {
        if let Err(e) = self.context.refresh(path, true).await {
            warn!("{}", e);
        }
    }

    fn announce(&self, line: &str) {
        self.console.write(format!("{}\n", line).as_bytes());
    }
}

pub fn request_for(
    project_root: impl Into<PathBuf>,
    source: &dyn ProjectConfigSource,
    kind: BuildKind,
) -> Result<BuildRequest, BuildError> {
    let board = source
        .board()
        .filter(|b| !b.trim().is_empty())
        .ok_or_else(|| BuildError::Configuration("no board configured for project".to_string()))?;
    Ok(BuildRequest::new(project_root, board).kind(kind))
}

async fn validate(request: &BuildRequest) -> Result<(), BuildError> {
    if request.target_id().trim().is_empty() {
        return Err(BuildError::Configuration("target board must not be empty".to_string()));
    }

    let is_dir = fs::metadata(request.project_root())
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !is_dir {
        return Err(BuildError::Configuration(format!(
            "project root {} is not a readable directory",
            request.project_root().display()
        )));
    }
    Ok(())
}

fn exit_reason(spec: &CommandSpec, code: Option<i32>) -> String {
    match code {
        Some(code) => format!("{} exited with code {}", spec.tool_name(), code),
        None => format!("{} was terminated by a signal", spec.tool_name()),
    }
}
