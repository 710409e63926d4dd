//! Image compression.
//!
//! Every supported format has a [`Compressor`]. Compressing is the slowest
//! step of a build, so results are kept in the [`Cache`] keyed by the
//! compressor identity and the fingerprint of the input.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use anyhow::Context;
use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{AnimationDecoder, ExtendedColorType, ImageEncoder, ImageFormat};

use crate::cache::{Cache, CacheKey, Fingerprint};
use crate::error::BuildError;
use crate::pipeline::{Artifact, Stage};
use crate::report::Reporter;

pub const JPEG_QUALITY: u8 = 75;

pub trait Compressor: Send + Sync {
    /// Names the compressor together with its settings, cached results are
    /// only reused for the same identity.
    fn identity(&self) -> String;

    fn compress(&self, input: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// Re-encodes all frames, looping forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gif;

impl Compressor for Gif {
    fn identity(&self) -> String {
        "gif:loop".into()
    }

    fn compress(&self, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        let frames = GifDecoder::new(Cursor::new(input))?
            .into_frames()
            .collect_frames()?;

        let mut out = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut out);
            encoder.set_repeat(Repeat::Infinite)?;
            encoder.encode_frames(frames)?;
        }

        Ok(out)
    }
}

/// Lossy re-encode at a fixed quality.
#[derive(Debug, Clone, Copy)]
pub struct Jpeg {
    pub quality: u8,
}

impl Default for Jpeg {
    fn default() -> Self {
        Self {
            quality: JPEG_QUALITY,
        }
    }
}

impl Compressor for Jpeg {
    fn identity(&self) -> String {
        format!("jpeg:q{}", self.quality)
    }

    fn compress(&self, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        let rgb = image::load_from_memory_with_format(input, ImageFormat::Jpeg)?.to_rgb8();

        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.quality).write_image(
            &rgb,
            rgb.width(),
            rgb.height(),
            ExtendedColorType::Rgb8,
        )?;

        Ok(out)
    }
}

/// Lossless re-encode with the strongest deflate setting.
#[derive(Debug, Clone, Copy, Default)]
pub struct Png;

impl Compressor for Png {
    fn identity(&self) -> String {
        "png:best".into()
    }

    fn compress(&self, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        let img = image::load_from_memory_with_format(input, ImageFormat::Png)?;

        let mut out = Vec::new();
        PngEncoder::new_with_quality(&mut out, CompressionType::Best, FilterType::Adaptive)
            .write_image(img.as_bytes(), img.width(), img.height(), img.color().into())?;

        Ok(out)
    }
}

/// Drops comments and the whitespace between tags.
#[derive(Debug, Clone, Copy, Default)]
pub struct Svg;

impl Compressor for Svg {
    fn identity(&self) -> String {
        "svg:text".into()
    }

    fn compress(&self, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        let text = std::str::from_utf8(input).context("svg is not valid UTF-8")?;
        Ok(minify_svg(text).into_bytes())
    }
}

fn minify_svg(text: &str) -> String {
    let mut stripped = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("<!--") {
        stripped.push_str(&rest[..start]);
        rest = match rest[start..].find("-->") {
            Some(end) => &rest[start + end + 3..],
            None => "",
        };
    }
    stripped.push_str(rest);

    let mut out = String::with_capacity(stripped.len());
    let mut parts = stripped.split('>').peekable();

    while let Some(part) = parts.next() {
        // whitespace only between a tag end and the next tag
        let trimmed = part.trim_start();
        if out.is_empty() || trimmed.starts_with('<') {
            out.push_str(trimmed);
        } else {
            out.push_str(part);
        }
        if parts.peek().is_some() {
            out.push('>');
        }
    }

    out.trim_end().to_string()
}

/// Compressors by lowercase file extension.
#[derive(Clone, Default)]
pub struct Compressors {
    map: HashMap<String, Arc<dyn Compressor>>,
}

impl Compressors {
    /// GIF, JPEG, PNG and SVG.
    pub fn standard() -> Self {
        let jpeg: Arc<dyn Compressor> = Arc::new(Jpeg::default());

        Self::default()
            .with("gif", Gif)
            .with_shared("jpg", jpeg.clone())
            .with_shared("jpeg", jpeg)
            .with("png", Png)
            .with("svg", Svg)
    }

    pub fn with(self, extension: &str, compressor: impl Compressor + 'static) -> Self {
        self.with_shared(extension, Arc::new(compressor))
    }

    pub fn with_shared(mut self, extension: &str, compressor: Arc<dyn Compressor>) -> Self {
        self.map.insert(extension.to_ascii_lowercase(), compressor);
        self
    }

    pub fn get(&self, extension: &str) -> Option<&Arc<dyn Compressor>> {
        self.map.get(&extension.to_ascii_lowercase())
    }
}

/// Compresses images, consulting the cache first. A file whose compression
/// fails is reported and written unchanged.
pub struct Compress {
    compressors: Compressors,
    cache: Option<Cache>,
    reporter: Reporter,
}

impl Compress {
    pub fn new(compressors: Compressors) -> Self {
        Self {
            compressors,
            cache: None,
            reporter: Reporter::default(),
        }
    }

    pub fn cache(mut self, cache: Cache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = reporter;
        self
    }

    fn compress(
        &self,
        compressor: &dyn Compressor,
        input: &Artifact,
    ) -> Result<Vec<u8>, BuildError> {
        let key = CacheKey::new(compressor.identity(), Fingerprint::of(&input.bytes));

        if let Some(cache) = &self.cache
            && let Some(bytes) = cache.lookup(&key)
        {
            tracing::trace!("cache hit for {}", input.source);
            return Ok(bytes);
        }

        let mut bytes = compressor
            .compress(&input.bytes)
            .map_err(|e| BuildError::compression(&input.source, e))?;

        if bytes.len() > input.bytes.len() {
            bytes = input.bytes.clone();
        }

        if let Some(cache) = &self.cache
            && let Err(e) = cache.store(&key, &bytes)
        {
            tracing::warn!("couldn't cache {}: {e}", input.source);
        }

        Ok(bytes)
    }
}

impl Stage for Compress {
    fn name(&self) -> &'static str {
        "compress"
    }

    fn apply(&self, input: Artifact) -> Result<Vec<Artifact>, BuildError> {
        let compressor = input.path.extension().and_then(|ext| self.compressors.get(ext));
        let Some(compressor) = compressor else {
            return Ok(vec![input]);
        };

        match self.compress(compressor.as_ref(), &input) {
            Ok(bytes) => Ok(vec![input.with_bytes(bytes)]),
            Err(e) => {
                self.reporter.report(&e);
                Ok(vec![input])
            }
        }
    }
}
