//! Static project configuration.
//!
//! The configuration is read once from an optional `tsukuri.toml` and is
//! immutable afterwards. Every field has a default, which reproduces the
//! classic `assets/src` → `assets/build` layout, so an empty (or missing)
//! file is a valid configuration.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::error::ConfigError;

/// Default name of the configuration file.
pub const CONFIG_FILE: &str = "tsukuri.toml";

/// One of the five categories of source files sharing a transform pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetClass {
    Markup,
    Script,
    Style,
    Image,
    Font,
}

impl AssetClass {
    pub const ALL: [AssetClass; 5] = [
        AssetClass::Markup,
        AssetClass::Style,
        AssetClass::Script,
        AssetClass::Font,
        AssetClass::Image,
    ];

    /// Name of the build task bound to this class.
    pub fn task_name(self) -> &'static str {
        match self {
            AssetClass::Markup => "html:build",
            AssetClass::Script => "js:build",
            AssetClass::Style => "css:build",
            AssetClass::Image => "image:build",
            AssetClass::Font => "fonts:build",
        }
    }
}

/// Glob patterns (or directories) for each asset class.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ClassPaths {
    pub html: String,
    pub js: String,
    #[serde(alias = "style")]
    pub css: String,
    pub img: String,
    pub fonts: String,
}

impl ClassPaths {
    pub fn get(&self, class: AssetClass) -> &str {
        match class {
            AssetClass::Markup => &self.html,
            AssetClass::Script => &self.js,
            AssetClass::Style => &self.css,
            AssetClass::Image => &self.img,
            AssetClass::Font => &self.fonts,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PathSet {
    pub source: ClassPaths,
    pub output: ClassPaths,
    pub watch: ClassPaths,
    /// Directory removed by the clean task.
    pub clean: String,
}

impl Default for PathSet {
    fn default() -> Self {
        Self {
            source: ClassPaths {
                html: "assets/src/*.html".into(),
                js: "assets/src/js/main.js".into(),
                css: "assets/src/style/main.scss".into(),
                img: "assets/src/img/**/*.*".into(),
                fonts: "assets/src/fonts/**/*.*".into(),
            },
            output: ClassPaths {
                html: "assets/build/".into(),
                js: "assets/build/js/".into(),
                css: "assets/build/css/".into(),
                img: "assets/build/img/".into(),
                fonts: "assets/build/fonts/".into(),
            },
            watch: ClassPaths {
                html: "assets/src/**/*.html".into(),
                js: "assets/src/js/**/*.js".into(),
                css: "assets/src/style/**/*.scss".into(),
                img: "assets/src/img/**/*.*".into(),
                fonts: "assets/src/fonts/**/*.*".into(),
            },
            clean: "assets/build".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerOptions {
    /// Directory served over HTTP.
    pub root: String,
    pub port: u16,
    /// Forward build errors to connected browsers.
    pub notify: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            root: "assets/build".into(),
            port: 8080,
            notify: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct WatchOptions {
    /// Coalescing window for filesystem events.
    pub debounce_ms: u64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self { debounce_ms: 100 }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BuildOptions {
    /// Write a `.map` file next to every script and style artifact.
    pub sourcemaps: bool,
    /// External command used to minify scripts, reading stdin and writing
    /// stdout. The built-in minifier is used when empty.
    pub minify_js_command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CacheOptions {
    pub dir: String,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            dir: ".cache/tsukuri".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Project root, every relative path in the configuration is resolved
    /// against it.
    #[serde(skip)]
    pub root: Utf8PathBuf,
    pub paths: PathSet,
    pub server: ServerOptions,
    pub watch: WatchOptions,
    pub build: BuildOptions,
    pub cache: CacheOptions,
}

impl Config {
    /// Loads the configuration from `path`. A missing file yields the default
    /// configuration rooted at the file's directory.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let root = match path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
            _ => Utf8PathBuf::try_from(std::env::current_dir()?)?,
        };

        let mut config = match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).map_err(|e| ConfigError::Parse(path.into(), e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file at {path}, using defaults");
                Self::default()
            }
            Err(e) => return Err(ConfigError::Read(path.into(), e)),
        };

        config.root = root;
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Default configuration rooted at `root`.
    pub fn with_root(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn resolve(&self, path: impl AsRef<Utf8Path>) -> Utf8PathBuf {
        self.root.join(path.as_ref())
    }

    pub fn output_dir(&self, class: AssetClass) -> Utf8PathBuf {
        self.resolve(self.paths.output.get(class))
    }

    pub fn clean_dir(&self) -> Utf8PathBuf {
        self.resolve(&self.paths.clean)
    }

    pub fn server_root(&self) -> Utf8PathBuf {
        self.resolve(&self.server.root)
    }

    pub fn cache_dir(&self) -> Utf8PathBuf {
        self.resolve(&self.cache.dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_default() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.paths, PathSet::default());
        assert_eq!(config.server.port, 8080);
        assert!(!config.server.notify);
        assert_eq!(config.watch.debounce_ms, 100);
    }

    #[test]
    fn test_partial_override() {
        let config = Config::parse(
            r#"
            [server]
            port = 3000

            [build]
            sourcemaps = true
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.root, "assets/build");
        assert!(config.build.sourcemaps);
        assert_eq!(config.paths.source.css, "assets/src/style/main.scss");
    }

    #[test]
    fn test_style_alias() {
        let config = Config::parse(
            r#"
            [paths.source]
            html = "src/*.html"
            js = "src/main.js"
            style = "src/main.scss"
            img = "src/img/*"
            fonts = "src/fonts/*"
            "#,
        )
        .unwrap();

        assert_eq!(config.paths.source.get(AssetClass::Style), "src/main.scss");
        // the remaining tables keep their defaults
        assert_eq!(config.paths.output.html, "assets/build/");
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        assert!(Config::parse("[server]\nhost = \"0.0.0.0\"").is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        let config = Config::load(root.join(CONFIG_FILE)).unwrap();
        assert_eq!(config.root, root);
        assert_eq!(config.clean_dir(), root.join("assets/build"));
    }
}
