//! Source maps.
//!
//! Stages that know where their output came from attach a [`Map`] to the
//! artifact: [`Include`](crate::pipeline::include::Include) maps expanded
//! lines back to the files they were read from, the minifiers map minified
//! code back to the readable artifact, and the stylesheet printer maps the
//! prefixed CSS back to the compiled stylesheet. The [`SourceMap`] stage
//! writes them out as version 3 documents.

use anyhow::anyhow;
use parcel_sourcemap::OriginalLocation;
use serde::Serialize;

use crate::error::BuildError;
use crate::pipeline::{Artifact, Stage};

/// Mappings of one artifact, with the sources they point into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Map {
    pub sources: Vec<String>,
    pub sources_content: Vec<String>,
    /// Base64 VLQ segments.
    pub mappings: String,
}

impl Map {
    /// A map over a single source.
    pub fn single(name: impl Into<String>, content: impl Into<String>, mappings: String) -> Self {
        Self {
            sources: vec![name.into()],
            sources_content: vec![content.into()],
            mappings,
        }
    }

    /// Every line maps to the same line of `content`.
    pub fn identity(name: &str, content: &str) -> anyhow::Result<Self> {
        let mut builder = Builder::new();
        let source = builder.source(name, content);
        for line in 0..content.lines().count() as u32 {
            builder.segment(line, 0, source, (line, 0));
        }
        builder.finish()
    }
}

/// Collects segments into a [`Map`].
pub(crate) struct Builder {
    inner: parcel_sourcemap::SourceMap,
    sources: Vec<String>,
    sources_content: Vec<String>,
}

impl Builder {
    pub(crate) fn new() -> Self {
        Self {
            inner: parcel_sourcemap::SourceMap::new("/"),
            sources: Vec::new(),
            sources_content: Vec::new(),
        }
    }

    /// Registers a source, returns its index. Known names keep theirs.
    pub(crate) fn source(&mut self, name: &str, content: &str) -> u32 {
        if let Some(index) = self.sources.iter().position(|s| s == name) {
            return index as u32;
        }

        self.inner.add_source(name);
        self.sources.push(name.to_string());
        self.sources_content.push(content.to_string());
        (self.sources.len() - 1) as u32
    }

    /// Lines and columns are zero based.
    pub(crate) fn segment(&mut self, line: u32, column: u32, source: u32, original: (u32, u32)) {
        let (original_line, original_column) = original;
        self.inner.add_mapping(
            line,
            column,
            Some(OriginalLocation {
                original_line,
                original_column,
                source,
                name: None,
            }),
        );
    }

    pub(crate) fn finish(mut self) -> anyhow::Result<Map> {
        Ok(Map {
            mappings: encode(&mut self.inner)?,
            sources: self.sources,
            sources_content: self.sources_content,
        })
    }
}

/// VLQ mappings of a map filled by someone else, e.g. the CSS printer.
pub(crate) fn encode(map: &mut parcel_sourcemap::SourceMap) -> anyhow::Result<String> {
    let mut vlq = Vec::new();
    map.write_vlq(&mut vlq).map_err(|e| anyhow!("{e:?}"))?;
    Ok(String::from_utf8(vlq)?)
}

/// Source map v3 document.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Document<'a> {
    version: u8,
    file: &'a str,
    sources: &'a [String],
    sources_content: &'a [String],
    names: [&'a str; 0],
    mappings: &'a str,
}

/// Emits `<artifact>.map` next to every artifact and links it with a
/// `sourceMappingURL` comment.
///
/// Artifacts that carry no mappings get a map that names their source file
/// and embeds it, without segments.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceMap;

impl SourceMap {
    fn fallback(input: &Artifact) -> Map {
        let name = input.source.file_name().unwrap_or_default();
        let content = std::fs::read_to_string(&input.source).unwrap_or_default();
        Map::single(name, content, String::new())
    }
}

impl Stage for SourceMap {
    fn name(&self) -> &'static str {
        "sourcemap"
    }

    fn apply(&self, mut input: Artifact) -> Result<Vec<Artifact>, BuildError> {
        let file = input.path.file_name().unwrap_or_default().to_string();
        let map = input.map.take().unwrap_or_else(|| Self::fallback(&input));

        let document = Document {
            version: 3,
            file: &file,
            sources: &map.sources,
            sources_content: &map.sources_content,
            names: [],
            mappings: &map.mappings,
        };

        let bytes = serde_json::to_vec(&document).map_err(|e| input.fail(e))?;
        let out = Artifact::new(input.source.clone(), format!("{}.map", input.path), bytes);

        let trailer = match input.path.extension() {
            Some("css") => format!("\n/*# sourceMappingURL={file}.map */\n"),
            _ => format!("\n//# sourceMappingURL={file}.map\n"),
        };
        input.bytes.extend_from_slice(trailer.as_bytes());

        Ok(vec![input, out])
    }
}
