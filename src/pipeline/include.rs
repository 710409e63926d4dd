//! File inclusion directives.
//!
//! A line consisting of a directive is replaced by the contents of the named
//! file, resolved relative to the including file. Two spellings are accepted,
//! one for scripts and one that keeps markup valid:
//!
//! ```text
//! //= partials/header.js
//! <!--= partials/header.html -->
//! ```
//!
//! Inclusion is recursive. The indentation of the directive is applied to
//! every included line.

use std::collections::HashSet;
use std::fs;

use anyhow::{Context, bail};
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::error::BuildError;
use crate::pipeline::sourcemap::Builder;
use crate::pipeline::{Artifact, Stage};

/// Expands inclusion directives.
#[derive(Debug, Clone, Copy, Default)]
pub struct Include;

impl Stage for Include {
    fn name(&self) -> &'static str {
        "include"
    }

    fn apply(&self, input: Artifact) -> Result<Vec<Artifact>, BuildError> {
        let text = input.text()?;

        let mut expander = Expander {
            base: input.source.parent().unwrap_or(Utf8Path::new("")),
            stack: vec![normalize_path(&input.source)],
            map: Builder::new(),
        };

        let (expanded, origins) = expander
            .expand(&input.source, text)
            .map_err(|e| input.fail(e))?;

        let mut map = expander.map;
        for (line, (source, original)) in origins.into_iter().enumerate() {
            map.segment(line as u32, 0, source, (original, 0));
        }
        let map = map.finish().map_err(|e| input.fail(e))?;

        Ok(vec![input.with_bytes(expanded.into_bytes()).with_map(map)])
    }
}

/// Returns the target of the directive on this line, if there is one.
fn directive(line: &str) -> Option<&str> {
    let line = line.trim();

    if let Some(rest) = line.strip_prefix("//=") {
        let target = rest.trim();
        return (!target.is_empty()).then_some(target);
    }

    let rest = line.strip_prefix("<!--=")?.strip_suffix("-->")?;
    let target = rest.trim();
    (!target.is_empty()).then_some(target)
}

fn resolve(from: &Utf8Path, target: &str) -> Utf8PathBuf {
    let dir = from.parent().unwrap_or(Utf8Path::new(""));
    normalize_path(&dir.join(target))
}

struct Expander<'a> {
    /// Source names in the map are relative to this directory.
    base: &'a Utf8Path,
    stack: Vec<Utf8PathBuf>,
    map: Builder,
}

impl Expander<'_> {
    fn source_name(&self, path: &Utf8Path) -> String {
        match path.strip_prefix(self.base) {
            Ok(rel) => rel.to_string(),
            Err(_) => path.file_name().unwrap_or(path.as_str()).to_string(),
        }
    }

    /// Returns the expanded text and, for each of its lines, the source
    /// index and line number it was read from.
    fn expand(
        &mut self,
        path: &Utf8Path,
        text: &str,
    ) -> anyhow::Result<(String, Vec<(u32, u32)>)> {
        let name = self.source_name(path);
        let source = self.map.source(&name, text);

        let mut out = String::with_capacity(text.len());
        let mut origins = Vec::new();

        for (number, line) in text.split_inclusive('\n').enumerate() {
            let number = number as u32;

            let Some(target) = directive(line) else {
                out.push_str(line);
                origins.push((source, number));
                continue;
            };

            let target = resolve(path, target);

            if self.stack.contains(&target) {
                let chain: Vec<_> = self.stack.iter().map(|p| p.as_str()).collect();
                bail!("include cycle: {} -> {}", chain.join(" -> "), target);
            }

            let included = fs::read_to_string(&target)
                .with_context(|| format!("couldn't include '{target}' from '{path}'"))?;

            self.stack.push(target.clone());
            let (included, lines) = self.expand(&target, &included)?;
            self.stack.pop();

            let indent = &line[..line.len() - line.trim_start().len()];
            for part in included.split_inclusive('\n') {
                out.push_str(indent);
                out.push_str(part);
            }
            origins.extend(lines);

            // keep the line break of the directive itself
            if line.ends_with('\n') && !out.ends_with('\n') {
                if out.is_empty() {
                    origins.push((source, number));
                }
                out.push('\n');
            }
        }

        Ok((out, origins))
    }
}

/// Every file directly referenced by a directive in one of the inputs.
pub(crate) fn referenced(inputs: &[Artifact]) -> HashSet<Utf8PathBuf> {
    let mut acc = HashSet::new();

    for input in inputs {
        let Ok(text) = std::str::from_utf8(&input.bytes) else {
            continue;
        };

        for line in text.lines() {
            if let Some(target) = directive(line) {
                acc.insert(resolve(&input.source, target));
            }
        }
    }

    acc
}

/// Normalize a path, removing things like `.` and `..`.
///
/// CAUTION: This does not resolve symlinks (unlike [`std::fs::canonicalize`]).
pub(crate) fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut components = path.components().peekable();
    let mut ret = if let Some(c @ Utf8Component::Prefix(..)) = components.peek().cloned() {
        components.next();
        Utf8PathBuf::from(c.as_str())
    } else {
        Utf8PathBuf::new()
    };

    for component in components {
        match component {
            Utf8Component::Prefix(..) => unreachable!(),
            Utf8Component::RootDir => {
                ret.push(Utf8Component::RootDir);
            }
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if ret.ends_with(Utf8Component::ParentDir) {
                    ret.push(Utf8Component::ParentDir);
                } else {
                    let popped = ret.pop();
                    if !popped && !ret.has_root() {
                        ret.push(Utf8Component::ParentDir);
                    }
                }
            }
            Utf8Component::Normal(c) => {
                ret.push(c);
            }
        }
    }

    ret
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AssetClass;
    use crate::pipeline::Pipeline;
    use crate::pipeline::tests::{project, put};

    fn run(root: &Utf8Path, path: &str) -> Result<String, BuildError> {
        let source = root.join(path);
        let bytes = fs::read(&source).unwrap();
        let out = Include.apply(Artifact::new(source, path, bytes))?;
        Ok(String::from_utf8(out[0].bytes.clone()).unwrap())
    }

    #[test]
    fn test_directive() {
        assert_eq!(directive("//= header.js\n"), Some("header.js"));
        assert_eq!(directive("   //=   a/b.js  "), Some("a/b.js"));
        assert_eq!(directive("<!--= partial.html -->"), Some("partial.html"));
        assert_eq!(directive("// just a comment"), None);
        assert_eq!(directive("//="), None);
        assert_eq!(directive("<!-- comment -->"), None);
    }

    #[test]
    fn test_nested_include_with_indent() {
        let (_guard, root) = project();
        put(&root, "js/main.js", "start();\n  //= parts/a.js\nend();\n");
        put(&root, "js/parts/a.js", "a();\n//= ../b.js\n");
        put(&root, "js/b.js", "b();\n");

        let out = run(&root, "js/main.js").unwrap();
        assert_eq!(out, "start();\n  a();\n  b();\nend();\n");
    }

    #[test]
    fn test_lines_map_to_their_files() {
        let (_guard, root) = project();
        put(&root, "js/main.js", "start();\n  //= parts/a.js\nend();\n");
        put(&root, "js/parts/a.js", "a();\n//= ../b.js\n");
        put(&root, "js/b.js", "b();\n");

        let source = root.join("js/main.js");
        let bytes = fs::read(&source).unwrap();
        let out = Include.apply(Artifact::new(source, "main.js", bytes)).unwrap();
        let map = out[0].map.as_ref().unwrap();

        assert_eq!(map.sources, vec!["main.js", "parts/a.js", "b.js"]);
        assert_eq!(map.sources_content[2], "b();\n");
        assert_eq!(map.mappings, "AAAA;ACAA;ACAA;AFEA");
    }

    #[test]
    fn test_missing_include_is_a_transform_error() {
        let (_guard, root) = project();
        put(&root, "main.js", "//= nope.js\n");

        let err = run(&root, "main.js").unwrap_err();
        assert!(matches!(err, BuildError::Transform { .. }));
    }

    #[test]
    fn test_cycle_is_detected() {
        let (_guard, root) = project();
        put(&root, "a.html", "<!--= b.html -->\n");
        put(&root, "b.html", "<!--= a.html -->\n");

        let err = run(&root, "a.html").unwrap_err();
        assert!(format!("{err:?}").contains("include cycle"));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Utf8Path::new("/a/./b/../c")), "/a/c");
        assert_eq!(normalize_path(Utf8Path::new("../x")), "../x");
    }

    #[test]
    fn test_markup_partials_are_not_emitted() {
        let (_guard, root) = project();
        put(
            &root,
            "assets/src/index.html",
            "<body>\n<!--= partial.html -->\n</body>\n",
        );
        put(&root, "assets/src/partial.html", "<p>Hi</p>");

        let pipeline = Pipeline::new(AssetClass::Markup, &root, root.join("assets/build"))
            .source("assets/src/*.html")
            .stage(Include)
            .skip_included();

        let written = pipeline.run().unwrap();

        assert_eq!(written, vec![root.join("assets/build/index.html")]);
        let index = fs::read_to_string(root.join("assets/build/index.html")).unwrap();
        assert!(index.contains("<p>Hi</p>"));
        assert!(!root.join("assets/build/partial.html").exists());
    }
}
