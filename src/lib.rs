#![forbid(unsafe_code)]
//! Static asset build pipeline.
//!
//! Build steps are tasks in a [`Registry`], composed into graphs of
//! sequences and parallel groups and run by an [`Executor`]. Each asset
//! class (markup, scripts, styles, images, fonts) is a [`Pipeline`] of
//! stages. In watch mode a [`Dispatcher`] maps file changes to the single
//! task that has to re-run, and connected browsers are told to reload or to
//! swap their stylesheets.
//!
//! ```rust,no_run
//! use tsukuri::{Config, Mode, Project};
//!
//! let config = Config::load("tsukuri.toml")?;
//! let project = Project::new(config, Mode::Build)?;
//! project.executor()?.run("build")?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod cache;
pub mod config;
pub mod engine;
mod error;
pub mod pipeline;
pub mod project;
pub mod report;
pub mod server;
mod utils;
pub mod watch;

pub use crate::cache::{Cache, CacheKey, Fingerprint};
pub use crate::config::{AssetClass, CONFIG_FILE, Config};
pub use crate::engine::{
    CancelToken, Executor, Graph, Join, Registry, TaskContext, TaskId, TaskResult, WeakExecutor,
};
pub use crate::error::*;
pub use crate::pipeline::{Artifact, Build, Pipeline, Stage};
pub use crate::project::{Mode, Project};
pub use crate::report::Reporter;
pub use crate::server::{ReloadChannel, Signal};
pub use crate::watch::{ChangeEvent, Dispatcher, WatchGroup};

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
