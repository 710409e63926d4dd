use std::collections::HashSet;
use std::fmt::Display;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use console::Style;
use indicatif::ProgressStyle;

const ANSI_BLUE: Style = Style::new().blue();

/// Installs the global `tracing` subscriber. Task spans are rendered as
/// spinners through `tracing-indicatif`, log lines go through the same
/// writer so they don't tear the progress bars.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init()?;

    Ok(())
}

pub(crate) fn get_style_task() -> Result<ProgressStyle, indicatif::style::TemplateError> {
    ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed}] {msg}")
}

pub(crate) fn as_overhead(s: Instant) -> impl Display {
    let f = format!("(+{}ms)", s.elapsed().as_millis());
    ANSI_BLUE.apply_to(f)
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut acc = String::with_capacity(bytes.len() * 2);

    for &byte in bytes {
        acc.push(HEX[(byte >> 4) as usize] as char);
        acc.push(HEX[(byte & 0xF) as usize] as char);
    }

    acc
}

/// Returns `true` if the pattern contains any glob metacharacters.
pub(crate) fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Splits a glob into its static base directory, made of all the components
/// before the first wildcard. A pattern without wildcards is a concrete file,
/// its base is the parent directory.
pub(crate) fn glob_base(pattern: &str) -> Utf8PathBuf {
    let path = Utf8Path::new(pattern);

    if !is_glob(pattern) {
        return path.parent().map(Utf8Path::to_path_buf).unwrap_or_default();
    }

    path.components()
        .take_while(|c| !is_glob(c.as_str()))
        .collect()
}

/// Reduces a set of paths to the minimal set of watch roots.
///
/// If we watch `/a` and `/a/b`, we only need to watch `/a` because the
/// watcher is recursive.
pub(crate) fn collapse_watch_paths(paths: HashSet<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    let mut paths: Vec<_> = paths.into_iter().collect();
    paths.sort();

    let mut filtered: Vec<Utf8PathBuf> = Vec::new();
    for path in paths {
        if let Some(last) = filtered.last() {
            if path.starts_with(last) {
                continue;
            }
        }
        filtered.push(path);
    }

    filtered
}
