use crate::console::ConsoleSink;
use crate::core::{CommandSpec, Diagnostic};
use crate::diagnostics::DiagnosticParser;
use crate::error::LaunchError;
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

pub struct StepOutput {
    console: Arc<dyn ConsoleSink>,
    parser: Option<Box<dyn DiagnosticParser>>,
    diagnostics: Vec<Diagnostic>,
    lines: usize,
}

impl StepOutput {
    pub fn console_only(console: Arc<dyn ConsoleSink>) -> Self {
        Self {
            console,
            parser: None,
            diagnostics: Vec::new(),
            lines: 0,
        }
    }

    pub fn parsed(console: Arc<dyn ConsoleSink>, parser: Box<dyn DiagnosticParser>) -> Self {
        Self {
            parser: Some(parser),
            ..Self::console_only(console)
        }
    }

    pub fn accept(&mut self, chunk: &[u8]) {
        self.lines += 1;
        self.console.write(chunk);

        if let Some(parser) = self.parser.as_mut() {
            let line = String::from_utf8_lossy(chunk);
            self.diagnostics.extend(parser.feed(&line));
        }
    }

    pub fn is_parsed(&self) -> bool {
        self.parser.is_some()
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        self.diagnostics
    }
}

impl fmt::Debug for StepOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepOutput")
            .field("parsed", &self.is_parsed())
            .field("lines", &self.lines)
            .field("diagnostics", &self.diagnostics)
            .finish()
    }
}

#[derive(Debug)]
pub enum StepOutcome {
    /// `code` is `None` when the process was terminated by a signal.
    Exited { code: Option<i32>, output: StepOutput },
    Cancelled,
}

impl StepOutcome {
    pub fn success(&self) -> bool {
        matches!(self, StepOutcome::Exited { code: Some(0), .. })
    }
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(
        &self,
        spec: &CommandSpec,
        output: StepOutput,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, LaunchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Unix,
    Windows,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(unix) {
            Platform::Unix
        } else if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Other
        }
    }

    fn prepare(&self, command: &mut Command) {
        // Own process group, so termination also reaches the compilers make spawns.
        #[cfg(unix)]
        {
            if *self == Platform::Unix {
                command.process_group(0);
            }
        }
        #[cfg(not(unix))]
        let _ = command;
    }

    async fn terminate(&self, child: &mut Child, pid: Option<u32>) {
        if *self == Platform::Unix {
            kill_process_group(pid);
        }
        if let Err(e) = child.kill().await {
            tracing::debug!("Kill after cancellation failed (process may have exited): {}", e);
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        tracing::debug!("killpg({}) failed: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

pub struct ProcessLauncher {
    platform: Platform,
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self {
            platform: Platform::current(),
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(
        &self,
        spec: &CommandSpec,
        output: StepOutput,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, LaunchError> {
        let program = spec.tool_name();
        tracing::debug!("Spawning {} in {:?}", spec, spec.current_dir);

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.current_dir)
            .env_clear()
            .envs(&spec.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        self.platform.prepare(&mut command);

        let mut child = command
            .spawn()
            .map_err(|e| LaunchError::from_spawn(program.clone(), e))?;
        let pid = child.id();

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(LaunchError::Spawn {
                program,
                source: io::Error::new(io::ErrorKind::Other, "output pipes unavailable"),
            });
        };

        // Drains the pipes while the child runs; a full pipe would otherwise stall it.
        let mut reader = tokio::spawn(pump_output(stdout, stderr, output));

        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                tracing::info!("Cancelling {} (pid {:?})", program, pid);
                self.platform.terminate(&mut child, pid).await;
                reader.abort();
                return Ok(StepOutcome::Cancelled);
            }
        };
        let status = status.map_err(|source| LaunchError::Wait {
            program: program.clone(),
            source,
        })?;

        // Descendants may still hold the pipes open after the child exits.
        let output = tokio::select! {
            joined = &mut reader => joined.map_err(|e| LaunchError::Wait {
                program: program.clone(),
                source: io::Error::new(io::ErrorKind::Other, e),
            })?,
            _ = cancel.cancelled() => {
                kill_process_group(pid);
                reader.abort();
                return Ok(StepOutcome::Cancelled);
            }
        };

        tracing::debug!("{} exited with {} after {} line(s)", program, status, output.lines());
        Ok(StepOutcome::Exited {
            code: status.code(),
            output,
        })
    }
}

pub async fn pump_output<O, E>(stdout: O, stderr: E, mut output: StepOutput) -> StepOutput
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut stdout = BufReader::new(stdout);
    let mut stderr = BufReader::new(stderr);
    let mut out_line = Vec::new();
    let mut err_line = Vec::new();
    let mut stdout_open = true;
    let mut stderr_open = true;

    // read_until keeps partial data in the buffer when another branch wins.
    while stdout_open || stderr_open {
        tokio::select! {
            read = read_line_capped(&mut stdout, &mut out_line), if stdout_open => {
                stdout_open = forward(read, &mut out_line, &mut output, "stdout");
            }
            read = read_line_capped(&mut stderr, &mut err_line), if stderr_open => {
                stderr_open = forward(read, &mut err_line, &mut output, "stderr");
            }
        }
    }

    output
}

// A longer run without a newline is forwarded in chunks of this size.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

async fn read_line_capped<R>(reader: &mut R, line: &mut Vec<u8>) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let room = MAX_LINE_BYTES.saturating_sub(line.len()).max(1) as u64;
    reader.take(room).read_until(b'\n', line).await
}

fn forward(read: io::Result<usize>, line: &mut Vec<u8>, output: &mut StepOutput, stream: &str) -> bool {
    match read {
        Ok(0) => false,
        Ok(_) => {
            output.accept(line);
            line.clear();
            true
        }
        Err(e) => {
            tracing::warn!("{} read error: {}", stream, e);
            false
        }
    }
}
