use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Task '{0}' is not registered")]
    UnknownTask(String),

    #[error("Task '{0}' is already registered")]
    DuplicateTask(String),

    #[error("Couldn't transform '{path}':\n{source}")]
    Transform {
        path: Utf8PathBuf,
        source: anyhow::Error,
    },

    #[error("IO error on '{path}':\n{source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't compress '{path}':\n{source}")]
    Compression {
        path: Utf8PathBuf,
        source: anyhow::Error,
    },

    #[error("Couldn't compile glob pattern.\n{0}")]
    Glob(#[from] glob::PatternError),

    #[error("Cancelled after a sibling task failed")]
    Cancelled,

    #[error("Task '{0}' panicked: {1}")]
    Panic(String, String),

    #[error("{0} file(s) failed to build")]
    Reported(usize),

    #[error("Error while watching for file changes:\n{0}")]
    Watch(#[from] notify::Error),

    #[error("Error while serving:\n{0}")]
    Serve(anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BuildError {
    pub(crate) fn io(path: impl Into<Utf8PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn transform(path: impl Into<Utf8PathBuf>, source: anyhow::Error) -> Self {
        Self::Transform {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn compression(path: impl Into<Utf8PathBuf>, source: anyhow::Error) -> Self {
        Self::Compression {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read config file '{0}'.\n{1}")]
    Read(Utf8PathBuf, std::io::Error),

    #[error("Couldn't parse config file '{0}'.\n{1}")]
    Parse(Utf8PathBuf, toml::de::Error),

    #[error("Couldn't resolve the project root.\n{0}")]
    Root(#[from] std::io::Error),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),
}
