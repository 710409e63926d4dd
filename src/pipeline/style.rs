//! Stylesheet stages: Sass compilation with `grass`, vendor prefixing and
//! minification with `lightningcss`.

use anyhow::anyhow;
use camino::Utf8Path;
use lightningcss::stylesheet::{MinifyOptions, ParserOptions, PrinterOptions, StyleSheet};
use lightningcss::targets::{Browsers, Targets};

use crate::error::BuildError;
use crate::pipeline::minify::Minifier;
use crate::pipeline::sourcemap::{Map, encode};
use crate::pipeline::{Artifact, Stage};

/// Compiles `.scss` into flat CSS. Imports are resolved relative to the
/// directory of the entry file. Plain `.css` files pass through.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileSass;

impl Stage for CompileSass {
    fn name(&self) -> &'static str {
        "sass"
    }

    fn apply(&self, input: Artifact) -> Result<Vec<Artifact>, BuildError> {
        if input.path.extension() == Some("css") {
            return Ok(vec![input]);
        }

        let text = input.text()?;
        let dir = input.source.parent().unwrap_or(Utf8Path::new("."));
        let options = grass::Options::default().load_path(dir.as_std_path());

        let css = grass::from_string(text.to_owned(), &options)
            .map_err(|e| input.fail(anyhow!("{e}")))?;

        Ok(vec![Artifact::new(
            input.source.clone(),
            input.path.with_extension("css"),
            css.into_bytes(),
        )])
    }
}

/// Browsers the emitted CSS has to work in, prefixes are added for them.
pub fn browser_targets() -> Targets {
    Targets::from(Browsers {
        chrome: Some(100 << 16),
        edge: Some(100 << 16),
        firefox: Some(100 << 16),
        safari: Some(14 << 16),
        ios_saf: Some(14 << 16),
        ..Browsers::default()
    })
}

/// Prints `code` for the target browsers, with a map back to `code`, which
/// is called `name` in the map.
fn process(name: &str, code: &str, minify: bool) -> anyhow::Result<(String, Map)> {
    let options = ParserOptions {
        filename: name.to_string(),
        ..ParserOptions::default()
    };

    let mut sheet = StyleSheet::parse(code, options).map_err(|e| anyhow!("{e}"))?;

    sheet
        .minify(MinifyOptions {
            targets: browser_targets(),
            ..MinifyOptions::default()
        })
        .map_err(|e| anyhow!("{e}"))?;

    let mut map = parcel_sourcemap::SourceMap::new("/");
    let out = sheet
        .to_css(PrinterOptions {
            minify,
            targets: browser_targets(),
            source_map: Some(&mut map),
            ..PrinterOptions::default()
        })
        .map_err(|e| anyhow!("{e}"))?;

    let mappings = encode(&mut map)?;
    Ok((out.code, Map::single(name, code, mappings)))
}

/// Adds the vendor prefixes required by [`browser_targets`], output stays
/// readable.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prefix;

impl Stage for Prefix {
    fn name(&self) -> &'static str {
        "prefix"
    }

    fn apply(&self, input: Artifact) -> Result<Vec<Artifact>, BuildError> {
        let name = input.source.file_name().unwrap_or(input.path.as_str());
        let (css, map) = process(name, input.text()?, false).map_err(|e| input.fail(e))?;
        Ok(vec![input.with_bytes(css.into_bytes()).with_map(map)])
    }
}

/// Minifier for the [`Minify`](crate::pipeline::minify::Minify) stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct CssMinifier;

impl Minifier for CssMinifier {
    fn minify(&self, name: &str, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(self.minify_mapped(name, input)?.0)
    }

    fn minify_mapped(&self, name: &str, input: &[u8]) -> anyhow::Result<(Vec<u8>, Option<Map>)> {
        let code = std::str::from_utf8(input)?;
        let (css, map) = process(name, code, true)?;
        Ok((css.into_bytes(), Some(map)))
    }
}
