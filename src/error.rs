use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("invalid build request: {0}")]
    Configuration(String),

    #[error("cannot create build directory {path}: {source}")]
    BuildDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("build cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("{program}: command not found")]
    NotFound { program: String },

    #[error("{program}: permission denied")]
    PermissionDenied { program: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl LaunchError {
    pub fn from_spawn(program: impl Into<String>, source: io::Error) -> Self {
        let program = program.into();
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound { program },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { program },
            _ => Self::Spawn { program, source },
        }
    }
}

#[derive(Error, Debug)]
#[error("failed to refresh {path}: {reason}")]
pub struct RefreshError {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read project settings {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid project settings {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
