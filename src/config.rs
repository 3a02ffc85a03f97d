use crate::detection::MarkerPolicy;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const PROJECT_SETTINGS_FILE: &str = "zephyr-project.json";

pub const DEFAULT_TOOLCHAIN: &str = "gnu";

pub trait ProjectConfigSource: Send + Sync {
    fn board(&self) -> Option<String>;
    /// Directories searched for the configuration and build tools before `PATH`.
    fn tool_paths(&self) -> Vec<PathBuf>;
    fn build_environment(&self) -> BTreeMap<String, String>;
    fn toolchain_id(&self) -> String;
    fn generator(&self) -> Generator;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Generator {
    #[default]
    Make,
    Ninja,
}

impl Generator {
    pub fn build_tool(&self) -> &'static str {
        match self {
            Generator::Make => "make",
            Generator::Ninja => "ninja",
        }
    }

    pub fn cmake_args(&self) -> &'static [&'static str] {
        match self {
            Generator::Make => &[],
            Generator::Ninja => &["-G", "Ninja"],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSettings {
    pub board: Option<String>,
    pub zephyr_base: Option<PathBuf>,
    pub toolchain_variant: Option<String>,
    pub toolchain_path: Option<PathBuf>,
    pub tool_paths: Vec<PathBuf>,
    pub generator: Generator,
    pub build_env: BTreeMap<String, String>,
}

impl ProjectSettings {
    pub async fn load(project_root: &Path) -> Result<Self, ConfigError> {
        let path = project_root.join(PROJECT_SETTINGS_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No project settings at {:?}, using defaults", path);
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        serde_json::from_str(&content).map_err(|source| ConfigError::Parse { path, source })
    }

    fn toolchain_location_var(variant: &str) -> Option<&'static str> {
        match variant {
            "zephyr" => Some("ZEPHYR_SDK_INSTALL_DIR"),
            "gnuarmemb" => Some("GNUARMEMB_TOOLCHAIN_PATH"),
            "xtools" => Some("XTOOLS_TOOLCHAIN_PATH"),
            "cross-compile" => Some("CROSS_COMPILE"),
            _ => None,
        }
    }
}

impl ProjectConfigSource for ProjectSettings {
    fn board(&self) -> Option<String> {
        self.board.clone()
    }

    fn tool_paths(&self) -> Vec<PathBuf> {
        self.tool_paths.clone()
    }

    fn build_environment(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();

        if let Some(base) = &self.zephyr_base {
            env.insert("ZEPHYR_BASE".to_string(), base.display().to_string());
        }

        if let Some(variant) = &self.toolchain_variant {
            env.insert("ZEPHYR_TOOLCHAIN_VARIANT".to_string(), variant.clone());
            if let (Some(var), Some(path)) =
                (Self::toolchain_location_var(variant), &self.toolchain_path)
            {
                env.insert(var.to_string(), path.display().to_string());
            }
        }

        // Explicit entries win over derived ones.
        env.extend(self.build_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    fn toolchain_id(&self) -> String {
        self.toolchain_variant
            .clone()
            .unwrap_or_else(|| DEFAULT_TOOLCHAIN.to_string())
    }

    fn generator(&self) -> Generator {
        self.generator
    }
}

#[derive(Debug, Clone, Default)]
pub enum AmbientEnv {
    #[default]
    Inherit,
    Fixed(BTreeMap<String, String>),
}

impl AmbientEnv {
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        match self {
            AmbientEnv::Inherit => utf8_environment(env::vars_os()),
            AmbientEnv::Fixed(vars) => vars.clone(),
        }
    }
}

/// Keeps UTF-8 variables. Build tools get a cleared environment, so dropped
/// ones are logged.
pub fn utf8_environment<I>(vars: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env = BTreeMap::new();
    for (key, value) in vars {
        match (key.into_string(), value.into_string()) {
            (Ok(key), Ok(value)) => {
                env.insert(key, value);
            }
            (key, _) => {
                let name = match &key {
                    Ok(name) => name.clone(),
                    Err(raw) => raw.to_string_lossy().into_owned(),
                };
                tracing::warn!("Not passing non UTF-8 environment variable {} to build tools", name);
            }
        }
    }
    env
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub configure_tool: String,
    pub search_paths: Vec<PathBuf>,
    pub marker: MarkerPolicy,
    pub ambient: AmbientEnv,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            configure_tool: "cmake".to_string(),
            search_paths: Vec::new(),
            marker: MarkerPolicy::default(),
            ambient: AmbientEnv::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub port: u16,
    pub tool_search_paths: Vec<PathBuf>,
    pub job_retention_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            tool_search_paths: Vec::new(),
            job_retention_secs: 3600,
        }
    }
}

impl RunnerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(defaults.port);

        let tool_search_paths = env::var_os("ZEPHYR_RUNNER_TOOL_PATH")
            .map(|paths| env::split_paths(&paths).collect())
            .unwrap_or_default();

        let job_retention_secs = env::var("ZEPHYR_RUNNER_JOB_RETENTION_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.job_retention_secs);

        Self {
            port,
            tool_search_paths,
            job_retention_secs,
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            search_paths: self.tool_search_paths.clone(),
            ..OrchestratorSettings::default()
        }
    }
}
