//! Wires the configuration into pipelines, tasks and watch groups.
//!
//! The registered tasks and composites mirror the classic asset workflow:
//!
//! ```text
//! build   = series(clean:build,
//!                  parallel(html:build, css:build, js:build, fonts:build, image:build))
//! default = series(build, parallel(webserver, watch))
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::cache::{self, Cache};
use crate::config::{AssetClass, Config};
use crate::engine::{Executor, Graph, Registry, WeakExecutor};
use crate::error::BuildError;
use crate::pipeline::{Build, Pipeline};
use crate::pipeline::image::{Compress, Compressors};
use crate::pipeline::include::Include;
use crate::pipeline::minify::Minify;
use crate::pipeline::script::{CommandMinifier, JsMinifier};
use crate::pipeline::sourcemap::SourceMap;
use crate::pipeline::style::{CompileSass, CssMinifier, Prefix};
use crate::report::Reporter;
use crate::server::{InjectReload, ReloadChannel};
use crate::watch::{Dispatcher, WatchGroup, watch};

pub const TASK_CLEAN: &str = "clean:build";
pub const TASK_CACHE_CLEAR: &str = "cache:clear";
pub const TASK_WEBSERVER: &str = "webserver";
pub const TASK_WATCH: &str = "watch";
pub const GRAPH_BUILD: &str = "build";
pub const GRAPH_DEFAULT: &str = "default";

/// How the project is going to be used, decides whether the reload channel
/// is bound and the client script injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// One-shot build.
    Build,
    /// Rebuild on change and notify browsers.
    Watch,
    /// Watch plus the HTTP server.
    Dev,
}

impl Mode {
    pub fn is_live(self) -> bool {
        !matches!(self, Mode::Build)
    }
}

/// Latest build of every class.
type Builds = Arc<Mutex<HashMap<AssetClass, Build>>>;

/// A configured asset project.
#[derive(Debug)]
pub struct Project {
    config: Arc<Config>,
    mode: Mode,
    reporter: Reporter,
    channel: ReloadChannel,
    builds: Builds,
}

impl Project {
    /// Binds the reload channel when `mode` is live.
    pub fn new(config: Config, mode: Mode) -> Result<Self, BuildError> {
        let channel = if mode.is_live() {
            let (channel, _thread) =
                ReloadChannel::bind().map_err(|e| BuildError::Serve(e.into()))?;
            channel
        } else {
            ReloadChannel::new()
        };

        Ok(Self::with_channel(config, mode, channel))
    }

    pub fn with_channel(config: Config, mode: Mode, channel: ReloadChannel) -> Self {
        let reporter = Reporter::new();

        if mode.is_live() && config.server.notify {
            let channel = channel.clone();
            reporter.subscribe(move |message| channel.notice(message));
        }

        Self {
            config: Arc::new(config),
            mode,
            reporter,
            channel,
            builds: Arc::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn channel(&self) -> &ReloadChannel {
        &self.channel
    }

    /// The pipeline of one asset class.
    pub fn pipeline(&self, class: AssetClass) -> Pipeline {
        let config = &self.config;
        let source = config.paths.source.get(class);

        let pipeline = Pipeline::new(class, &config.root, config.output_dir(class))
            .source(source)
            .reporter(self.reporter.clone());

        match class {
            AssetClass::Markup => {
                let pipeline = pipeline.stage(Include).skip_included();
                match self.channel.port() {
                    Some(port) if self.mode.is_live() => pipeline.stage(InjectReload::new(port)),
                    _ => pipeline,
                }
            }
            AssetClass::Style => {
                let pipeline = pipeline
                    .stage(CompileSass)
                    .stage(Prefix)
                    .stage(Minify::new(CssMinifier));
                self.with_sourcemaps(pipeline)
            }
            AssetClass::Script => {
                let minify = match CommandMinifier::new(config.build.minify_js_command.clone()) {
                    Some(command) => Minify::new(command),
                    None => Minify::new(JsMinifier),
                };
                let pipeline = pipeline.stage(Include).stage(minify);
                self.with_sourcemaps(pipeline)
            }
            AssetClass::Image => pipeline.stage(
                Compress::new(Compressors::standard())
                    .cache(Cache::open(config.cache_dir()))
                    .reporter(self.reporter.clone()),
            ),
            AssetClass::Font => pipeline,
        }
    }

    fn with_sourcemaps(&self, pipeline: Pipeline) -> Pipeline {
        if self.config.build.sourcemaps {
            pipeline.stage(SourceMap)
        } else {
            pipeline
        }
    }

    /// Registers every task and composite. The watch task runs through the
    /// returned executor.
    pub fn executor(&self) -> Result<Executor, BuildError> {
        let mut registry = Registry::new();
        let config = self.config.clone();

        let clean = {
            let root = config.clean_dir();
            registry.register(TASK_CLEAN, move |_| cache::clean(&root))?
        };

        let mut classes = Vec::with_capacity(AssetClass::ALL.len());
        for class in AssetClass::ALL {
            let pipeline = self.pipeline(class);
            let builds = self.builds.clone();

            let id = registry.register(class.task_name(), move |_| {
                let build = pipeline.build()?;
                builds
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(class, build);
                Ok(())
            })?;

            classes.push(id);
        }

        {
            let cache = Cache::open(config.cache_dir());
            registry.register(TASK_CACHE_CLEAR, move |_| cache.clear_all())?;
        }

        let webserver = {
            let root = config.server_root();
            let port = config.server.port;
            registry.register(TASK_WEBSERVER, move |_| serve(root.clone(), port))?
        };

        // the watch task runs the other tasks of this registry, which owns it
        let cell: Arc<OnceLock<WeakExecutor>> = Arc::new(OnceLock::new());
        let watcher = {
            let cell = cell.clone();
            let root = config.root.clone();
            let groups = self.watch_groups();
            let debounce = Duration::from_millis(config.watch.debounce_ms);

            registry.register(TASK_WATCH, move |_| {
                let executor = cell
                    .get()
                    .and_then(WeakExecutor::upgrade)
                    .ok_or_else(|| BuildError::UnknownTask(TASK_WATCH.into()))?;

                let dispatcher = Dispatcher::new(executor, root.clone(), groups.clone())?;
                watch(&dispatcher, debounce)?;
                dispatcher.shutdown();
                Ok(())
            })?
        };

        let build = Graph::sequence([Graph::leaf(clean), Graph::parallel(classes)]);
        let default = Graph::sequence([build.clone(), Graph::parallel([webserver, watcher])]);

        registry.define(GRAPH_BUILD, build)?;
        registry.define(GRAPH_DEFAULT, default)?;

        let executor = Executor::new(registry);
        cell.set(executor.downgrade()).ok();

        Ok(executor)
    }

    /// Runs a task or composite. A one-shot build also fails when any file
    /// failed along the way, live modes only fail when the graph does.
    pub fn run(&self, executor: &Executor, target: &str) -> Result<(), BuildError> {
        let before = self.reporter.count();
        executor.run(target)?;

        let failed = self.reporter.count() - before;
        if self.mode == Mode::Build && failed > 0 {
            return Err(BuildError::Reported(failed));
        }

        Ok(())
    }

    /// One group per class. Stylesheets are patched in place, anything else
    /// reloads the page. A rebuild in which files failed sends nothing, the
    /// browser keeps the last good state and the failures go out as notices.
    pub fn watch_groups(&self) -> Vec<WatchGroup> {
        AssetClass::ALL
            .into_iter()
            .map(|class| {
                let channel = self.channel.clone();
                let builds = self.builds.clone();
                let server_root = self.config.server_root();
                let group = WatchGroup::new(class.task_name()) //
                    .glob(self.config.paths.watch.get(class));

                group.on_success(move || {
                    let build = {
                        let builds = builds.lock().unwrap_or_else(|e| e.into_inner());
                        builds.get(&class).cloned()
                    };
                    let Some(build) = build else {
                        return;
                    };

                    if build.failed > 0 {
                        tracing::debug!("{} file(s) failed, not reloading", build.failed);
                        return;
                    }

                    if class != AssetClass::Style {
                        channel.notify_full_reload();
                        return;
                    }

                    let paths = style_paths(&build, &server_root);
                    if paths.is_empty() {
                        channel.notify_full_reload();
                    } else {
                        channel.notify_style_patch(paths);
                    }
                })
            })
            .collect()
    }
}

/// Stylesheets of a style build, relative to the server root.
fn style_paths(build: &Build, server_root: &Utf8Path) -> Vec<String> {
    build
        .written
        .iter()
        .filter(|path| path.extension() == Some("css"))
        .filter_map(|path| path.strip_prefix(server_root).ok())
        .map(|path| path.as_str().replace('\\', "/"))
        .collect()
}

#[cfg(feature = "server")]
fn serve(root: Utf8PathBuf, port: u16) -> Result<(), BuildError> {
    crate::server::http::serve(root, port)
}

#[cfg(not(feature = "server"))]
fn serve(_: Utf8PathBuf, _: u16) -> Result<(), BuildError> {
    tracing::warn!("built without the `server` feature, not serving");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::pipeline::tests::{project, put};
    use crate::server::Signal;
    use crate::server::tests::Recorder;

    fn scaffold(root: &Utf8Path) {
        put(root, "assets/src/index.html", "<body>\n<!--= partial.html -->\n</body>\n");
        put(root, "assets/src/partial.html", "<p>Hi</p>\n");
        put(root, "assets/src/js/main.js", "//= lib.js\nstart( );\n");
        put(root, "assets/src/js/lib.js", "function start() {\n  // go\n}\n");
        put(root, "assets/src/style/_vars.scss", "$gap: 4px;\n");
        put(root, "assets/src/style/main.scss", "@import 'vars';\n.a { margin: $gap; }\n");
        put(root, "assets/src/fonts/sans.woff2", b"wOF2");
        put(root, "assets/src/img/icons/dot.svg", "<svg>\n  <!-- x -->\n  <circle/>\n</svg>\n");
    }

    fn one_shot(root: &Utf8Path, mode: Mode) -> Project {
        Project::with_channel(Config::with_root(root), mode, ReloadChannel::new())
    }

    fn files(root: &Utf8Path) -> Vec<String> {
        let mut acc = Vec::new();
        let pattern = format!("{}/**/*", root);
        for path in glob::glob(&pattern).unwrap().flatten() {
            if path.is_file() {
                let path = Utf8PathBuf::try_from(path).unwrap();
                acc.push(path.strip_prefix(root).unwrap().to_string());
            }
        }
        acc.sort();
        acc
    }

    #[test]
    fn test_build_graph() {
        let (_guard, root) = project();
        let project = one_shot(&root, Mode::Build);
        let executor = project.executor().unwrap();
        let registry = executor.registry();

        assert_eq!(
            registry.resolve(GRAPH_BUILD).unwrap().describe(registry),
            concat!(
                "series(clean:build, parallel(html:build, css:build, js:build, ",
                "fonts:build, image:build))"
            )
        );
        assert_eq!(
            registry.resolve(GRAPH_DEFAULT).unwrap().describe(registry),
            concat!(
                "series(series(clean:build, parallel(html:build, css:build, js:build, ",
                "fonts:build, image:build)), parallel(webserver, watch))"
            )
        );
        assert!(registry.names().contains(&"cache:clear"));
    }

    #[test]
    fn test_build_end_to_end() {
        let (_guard, root) = project();
        scaffold(&root);

        let project = one_shot(&root, Mode::Build);
        let executor = project.executor().unwrap();
        executor.run(GRAPH_BUILD).unwrap();

        assert!(!project.reporter().has_errors());
        assert_eq!(
            files(&root.join("assets/build")),
            vec![
                "css/main.css",
                "css/main.min.css",
                "fonts/sans.woff2",
                "img/icons/dot.svg",
                "index.html",
                "js/main.js",
                "js/main.min.js",
            ]
        );

        let html = fs::read_to_string(root.join("assets/build/index.html")).unwrap();
        assert!(html.contains("<p>Hi</p>"));
        assert!(!html.contains("WebSocket"));

        let svg = fs::read_to_string(root.join("assets/build/img/icons/dot.svg")).unwrap();
        assert_eq!(svg, "<svg><circle/></svg>");
    }

    #[test]
    fn test_clean_then_build_leaves_no_stale_files() {
        let (_guard, root) = project();
        scaffold(&root);
        put(&root, "assets/build/css/old.css", ".old{}");
        put(&root, "assets/build/stale.html", "<p>old</p>");

        let project = one_shot(&root, Mode::Build);
        project.executor().unwrap().run(GRAPH_BUILD).unwrap();

        let files = files(&root.join("assets/build"));
        assert!(!files.contains(&"css/old.css".to_string()));
        assert!(!files.contains(&"stale.html".to_string()));
        assert!(files.contains(&"css/main.css".to_string()));
    }

    #[test]
    fn test_missing_style_entry_fails_build() {
        let (_guard, root) = project();
        scaffold(&root);
        fs::remove_file(root.join("assets/src/style/main.scss")).unwrap();

        let project = one_shot(&root, Mode::Build);
        let result = project.executor().unwrap().run(GRAPH_BUILD);

        assert!(matches!(result, Err(BuildError::Io { .. })));
        // siblings still settle
        assert!(root.join("assets/build/index.html").exists());
    }

    #[test]
    fn test_live_markup_gets_the_client_script() {
        let (_guard, root) = project();
        scaffold(&root);

        let (channel, _thread) = ReloadChannel::bind().unwrap();
        let port = channel.port().unwrap();
        let project = Project::with_channel(Config::with_root(&root), Mode::Dev, channel);
        project.pipeline(AssetClass::Markup).run().unwrap();

        let html = fs::read_to_string(root.join("assets/build/index.html")).unwrap();
        assert!(html.contains(&format!("ws://localhost:{port}")));
    }

    #[test]
    fn test_style_rebuild_patches_styles() {
        let (_guard, root) = project();
        scaffold(&root);

        let channel = ReloadChannel::new();
        let browser = Recorder::default();
        channel.attach(browser.clone());

        let project = Project::with_channel(Config::with_root(&root), Mode::Watch, channel);
        let executor = project.executor().unwrap();
        let dispatcher = Dispatcher::new(executor, &root, project.watch_groups()).unwrap();

        assert!(dispatcher.changed(&root.join("assets/src/style/main.scss")));
        dispatcher.shutdown();

        assert_eq!(
            browser.signals(),
            vec![Signal::Style {
                paths: vec!["css/main.css".into(), "css/main.min.css".into()]
            }]
        );
        assert!(root.join("assets/build/css/main.css").exists());
    }

    #[test]
    fn test_notices_are_forwarded() {
        let (_guard, root) = project();
        scaffold(&root);
        put(&root, "assets/src/style/main.scss", ".a { color: $nope; }\n");

        let mut config = Config::with_root(&root);
        config.server.notify = true;

        let channel = ReloadChannel::new();
        let browser = Recorder::default();
        channel.attach(browser.clone());

        let project = Project::with_channel(config, Mode::Dev, channel);
        project.pipeline(AssetClass::Style).run().unwrap();

        assert!(matches!(&browser.signals()[..], [Signal::Notice { .. }]));
        assert_eq!(project.reporter().count(), 1);
    }

    #[test]
    fn test_failed_style_rebuild_only_sends_the_notice() {
        let (_guard, root) = project();
        scaffold(&root);

        let mut config = Config::with_root(&root);
        config.server.notify = true;

        let channel = ReloadChannel::new();
        let browser = Recorder::default();
        channel.attach(browser.clone());

        let project = Project::with_channel(config, Mode::Dev, channel);
        let executor = project.executor().unwrap();
        let dispatcher = Dispatcher::new(executor, &root, project.watch_groups()).unwrap();

        put(&root, "assets/src/style/main.scss", ".a { color: $nope; }\n");
        assert!(dispatcher.changed(&root.join("assets/src/style/main.scss")));
        dispatcher.shutdown();

        let signals = browser.signals();
        assert_eq!(signals.len(), 1);
        assert!(matches!(&signals[0], Signal::Notice { message } if message.contains("main.scss")));
    }

    #[test]
    fn test_reported_errors_fail_only_one_shot_builds() {
        let (_guard, root) = project();
        scaffold(&root);
        put(&root, "assets/src/style/main.scss", ".a { color: $nope; }\n");

        let project = one_shot(&root, Mode::Build);
        let result = project.run(&project.executor().unwrap(), GRAPH_BUILD);
        assert!(matches!(result, Err(BuildError::Reported(1))));

        let project = one_shot(&root, Mode::Watch);
        project.run(&project.executor().unwrap(), GRAPH_BUILD).unwrap();
        assert_eq!(project.reporter().count(), 1);
    }

    #[test]
    fn test_executor_is_dropped_with_its_last_handle() {
        let (_guard, root) = project();

        let project = one_shot(&root, Mode::Build);
        let executor = project.executor().unwrap();
        let weak = executor.downgrade();

        drop(executor);
        assert!(weak.upgrade().is_none());
    }
}
