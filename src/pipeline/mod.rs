//! File pipelines.
//!
//! A [`Pipeline`] reads every file matched by its source patterns, pushes it
//! through an ordered list of [`Stage`]s and writes the resulting
//! [`Artifact`]s under its output directory. A stage maps one artifact to
//! any number of artifacts, which is how a single stylesheet becomes both
//! `main.css` and `main.min.css`.

pub mod image;
pub mod include;
pub mod minify;
pub mod script;
pub mod sourcemap;
pub mod style;

use std::fs;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::config::AssetClass;
use crate::error::BuildError;
use crate::pipeline::sourcemap::Map;
use crate::report::Reporter;
use crate::utils::{as_overhead, glob_base, is_glob};

/// A file flowing through a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// The source file this artifact was derived from.
    pub source: Utf8PathBuf,
    /// Destination, relative to the output directory of the pipeline.
    pub path: Utf8PathBuf,
    pub bytes: Vec<u8>,
    /// Where the bytes came from, when a stage knows.
    pub map: Option<Map>,
}

impl Artifact {
    pub fn new(
        source: impl Into<Utf8PathBuf>,
        path: impl Into<Utf8PathBuf>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            source: source.into(),
            path: path.into(),
            bytes,
            map: None,
        }
    }

    /// Same artifact with different contents. The map is dropped.
    pub fn with_bytes(&self, bytes: Vec<u8>) -> Self {
        Self::new(self.source.clone(), self.path.clone(), bytes)
    }

    pub fn with_map(mut self, map: Map) -> Self {
        self.map = Some(map);
        self
    }

    pub fn text(&self) -> Result<&str, BuildError> {
        std::str::from_utf8(&self.bytes)
            .map_err(|e| BuildError::transform(&self.source, e.into()))
    }

    pub(crate) fn fail(&self, error: impl Into<anyhow::Error>) -> BuildError {
        BuildError::transform(&self.source, error.into())
    }
}

/// One transformation step.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, input: Artifact) -> Result<Vec<Artifact>, BuildError>;
}

/// Result of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Build {
    /// Written files, sorted.
    pub written: Vec<Utf8PathBuf>,
    /// Files that were reported and skipped.
    pub failed: usize,
}

/// Transforms every matched source file of one asset class.
pub struct Pipeline {
    class: AssetClass,
    root: Utf8PathBuf,
    sources: Vec<String>,
    output: Utf8PathBuf,
    stages: Vec<Box<dyn Stage>>,
    skip_included: bool,
    reporter: Reporter,
    /// Serializes runs, two concurrent rebuilds of the same class would
    /// interleave writes to the same files.
    lock: Mutex<()>,
}

impl Pipeline {
    /// `root` is the directory the source patterns are relative to, `output`
    /// is where the artifacts are written.
    pub fn new(
        class: AssetClass,
        root: impl Into<Utf8PathBuf>,
        output: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            class,
            root: root.into(),
            sources: Vec::new(),
            output: output.into(),
            stages: Vec::new(),
            skip_included: false,
            reporter: Reporter::default(),
            lock: Mutex::new(()),
        }
    }

    /// Adds a source pattern. A pattern without wildcards names a single
    /// entry file, which must exist.
    pub fn source(mut self, pattern: impl Into<String>) -> Self {
        self.sources.push(pattern.into());
        self
    }

    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Files included by other matched files are partials and don't produce
    /// standalone outputs.
    pub fn skip_included(mut self) -> Self {
        self.skip_included = true;
        self
    }

    pub fn reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn class(&self) -> AssetClass {
        self.class
    }

    pub fn output(&self) -> &Utf8Path {
        &self.output
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Builds the class. Returns the paths of all written files.
    pub fn run(&self) -> Result<Vec<Utf8PathBuf>, BuildError> {
        Ok(self.build()?.written)
    }

    /// Builds the class, also counting the files that failed.
    pub fn build(&self) -> Result<Build, BuildError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let s = Instant::now();
        let failed = AtomicUsize::new(0);

        let mut inputs = self.collect_inputs(&failed)?;

        if self.skip_included {
            let included = include::referenced(&inputs);
            inputs.retain(|input| !included.contains(&include::normalize_path(&input.source)));
        }

        let artifacts: Vec<Artifact> = inputs
            .into_par_iter()
            .flat_map_iter(|input| match self.transform(input) {
                Ok(artifacts) => artifacts,
                Err(e) => {
                    self.skip(&failed, &e);
                    Vec::new()
                }
            })
            .collect();

        let mut written = artifacts
            .into_par_iter()
            .map(|artifact| self.write(artifact))
            .collect::<Result<Vec<_>, _>>()?;
        written.sort();

        tracing::info!(
            "{:?}: wrote {} file(s) to {} {}",
            self.class,
            written.len(),
            self.output,
            as_overhead(s)
        );

        Ok(Build {
            written,
            failed: failed.into_inner(),
        })
    }

    fn skip(&self, failed: &AtomicUsize, error: &BuildError) {
        failed.fetch_add(1, Ordering::SeqCst);
        self.reporter.report(error);
    }

    fn transform(&self, input: Artifact) -> Result<Vec<Artifact>, BuildError> {
        let mut current = vec![input];

        for stage in &self.stages {
            let mut next = Vec::with_capacity(current.len());
            for artifact in current {
                next.extend(stage.apply(artifact)?);
            }
            current = next;
        }

        Ok(current)
    }

    fn write(&self, artifact: Artifact) -> Result<Utf8PathBuf, BuildError> {
        let path = self.output.join(&artifact.path);

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| BuildError::io(dir, e))?;
        }

        fs::write(&path, &artifact.bytes).map_err(|e| BuildError::io(&path, e))?;
        Ok(path)
    }

    fn collect_inputs(&self, failed: &AtomicUsize) -> Result<Vec<Artifact>, BuildError> {
        let mut inputs = Vec::new();

        for pattern in &self.sources {
            if !is_glob(pattern) {
                // a singular entry is the whole point of the build, losing it
                // fails the class
                let path = self.root.join(pattern);
                let bytes = fs::read(&path).map_err(|e| BuildError::io(&path, e))?;
                let name = path.file_name().unwrap_or(pattern.as_str()).to_string();
                inputs.push(Artifact::new(path, name, bytes));
                continue;
            }

            let base = self.root.join(glob_base(pattern));
            let full = format!("{}/{}", Pattern::escape(self.root.as_str()), pattern);

            for entry in glob::glob(&full)? {
                let path = match entry {
                    Ok(path) => path,
                    Err(e) => {
                        let path = Utf8PathBuf::from(e.path().to_string_lossy().into_owned());
                        self.skip(failed, &BuildError::io(path, e.into_error()));
                        continue;
                    }
                };

                let path = match Utf8PathBuf::try_from(path) {
                    Ok(path) => path,
                    Err(e) => {
                        tracing::warn!("skipping non UTF-8 path {:?}", e.as_path());
                        continue;
                    }
                };

                if !path.is_file() {
                    continue;
                }

                let bytes = match fs::read(&path) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        self.skip(failed, &BuildError::io(&path, e));
                        continue;
                    }
                };

                let rel = path
                    .strip_prefix(&base)
                    .map(Utf8Path::to_path_buf)
                    .unwrap_or_else(|_| path.file_name().unwrap_or_default().into());

                inputs.push(Artifact::new(path, rel, bytes));
            }
        }

        Ok(inputs)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("class", &self.class)
            .field("sources", &self.sources)
            .field("output", &self.output)
            .field("stages", &self.stage_names())
            .finish()
    }
}

/// Appends `suffix` to the file stem: `main.css` becomes `main.min.css`.
pub(crate) fn with_suffix(path: &Utf8Path, suffix: &str) -> Utf8PathBuf {
    let stem = path.file_stem().unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}{suffix}.{ext}"),
        None => format!("{stem}{suffix}"),
    };
    path.with_file_name(name)
}
