use crate::error::BuildError;
use crate::pipeline::sourcemap::Map;
use crate::pipeline::{Artifact, Stage, with_suffix};

/// A content minifier, used by the [`Minify`] stage.
pub trait Minifier: Send + Sync {
    fn minify(&self, name: &str, input: &[u8]) -> anyhow::Result<Vec<u8>>;

    /// Also maps the output back to `input`, which is called `name` in the
    /// map. Minifiers that can't track positions return no map.
    fn minify_mapped(&self, name: &str, input: &[u8]) -> anyhow::Result<(Vec<u8>, Option<Map>)> {
        Ok((self.minify(name, input)?, None))
    }
}

impl<F> Minifier for F
where
    F: Fn(&str, &[u8]) -> anyhow::Result<Vec<u8>> + Send + Sync,
{
    fn minify(&self, name: &str, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        self(name, input)
    }
}

/// Forks every artifact into itself and a minified copy named with a
/// suffix, `main.js` yields `main.js` and `main.min.js`.
pub struct Minify {
    minifier: Box<dyn Minifier>,
    suffix: &'static str,
}

impl Minify {
    pub const SUFFIX: &'static str = ".min";

    pub fn new(minifier: impl Minifier + 'static) -> Self {
        Self {
            minifier: Box::new(minifier),
            suffix: Self::SUFFIX,
        }
    }

    pub fn suffix(mut self, suffix: &'static str) -> Self {
        self.suffix = suffix;
        self
    }
}

impl Stage for Minify {
    fn name(&self) -> &'static str {
        "minify"
    }

    fn apply(&self, input: Artifact) -> Result<Vec<Artifact>, BuildError> {
        let name = input.path.file_name().unwrap_or(input.path.as_str());

        let (mut bytes, mut map) = self
            .minifier
            .minify_mapped(name, &input.bytes)
            .map_err(|e| input.fail(e))?;

        // a minified artifact is never larger than its source
        if bytes.len() > input.bytes.len() {
            tracing::debug!("minifier grew {}, keeping the original", input.path);
            bytes = input.bytes.clone();
            map = match input.text() {
                Ok(text) => Some(Map::identity(name, text).map_err(|e| input.fail(e))?),
                Err(_) => None,
            };
        }

        let mut minified = Artifact::new(
            input.source.clone(),
            with_suffix(&input.path, self.suffix),
            bytes,
        );
        minified.map = map;

        Ok(vec![input, minified])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fork_names_and_size_guard() {
        let stage = Minify::new(|_: &str, input: &[u8]| -> anyhow::Result<Vec<u8>> {
            let mut out = input.to_vec();
            out.extend_from_slice(b"/* banner */");
            Ok(out)
        });

        let out = stage
            .apply(Artifact::new("src/main.js", "main.js", b"a();".to_vec()))
            .unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].path, "main.js");
        assert_eq!(out[1].path, "main.min.js");
        assert_eq!(out[1].bytes, b"a();");
        // the kept original maps onto itself
        assert_eq!(out[1].map.as_ref().unwrap().sources, vec!["main.js"]);
        assert_eq!(out[1].map.as_ref().unwrap().mappings, "AAAA");
    }

    #[test]
    fn test_failure_is_a_transform_error() {
        let stage = Minify::new(|_: &str, _: &[u8]| -> anyhow::Result<Vec<u8>> {
            anyhow::bail!("broken")
        });

        let err = stage
            .apply(Artifact::new("src/main.js", "main.js", b"a();".to_vec()))
            .unwrap_err();

        assert!(matches!(err, BuildError::Transform { path, .. } if path == "src/main.js"));
    }
}
