use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{Context, bail};

use crate::pipeline::minify::Minifier;
use crate::pipeline::sourcemap::{Builder, Map};

/// Words after which a `/` starts a regular expression rather than a division.
const KEYWORDS: &[&str] = &[
    "return",
    "typeof",
    "instanceof",
    "in",
    "of",
    "new",
    "delete",
    "void",
    "throw",
    "case",
    "do",
    "else",
    "yield",
    "await",
];

/// A line break after one of these can never end a statement.
const BREAK_AFTER: &[char] = &[
    '{', '(', '[', ',', ';', ':', '=', '&', '|', '?', '!', '*', '%', '<', '>', '^', '~',
];

/// A line break before one of these can never end a statement.
const BREAK_BEFORE: &[char] = &[
    '}', ')', ']', ',', ';', ':', '.', '=', '?', '&', '|', '*', '%', '<', '>', '^',
];

/// Whitespace and comment remover for JavaScript.
///
/// It doesn't parse, so it only does what is safe on the token level:
/// comments go away, runs of whitespace shrink to at most one character
/// and line breaks are only dropped where automatic semicolon insertion
/// can't depend on them. String, template and regular expression literals
/// are copied verbatim. The output is never longer than the input.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsMinifier;

impl Minifier for JsMinifier {
    fn minify(&self, _: &str, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        let code = std::str::from_utf8(input)?;
        Ok(minify_js(code).into_bytes())
    }

    fn minify_mapped(&self, name: &str, input: &[u8]) -> anyhow::Result<(Vec<u8>, Option<Map>)> {
        let code = std::str::from_utf8(input)?;
        let (out, segments) = minify_tracked(code);

        let mut map = Builder::new();
        let source = map.source(name, code);
        for ((line, column), original) in segments {
            map.segment(line, column, source, original);
        }

        Ok((out.into_bytes(), Some(map.finish()?)))
    }
}

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$' || !c.is_ascii()
}

fn separator(prev: char, next: char, newline: bool) -> Option<char> {
    let glue = if newline { '\n' } else { ' ' };

    if is_word(prev) && is_word(next) {
        return Some(glue);
    }

    // `a + +b`, `a - -b`, `a++\nb`
    if matches!(prev, '+' | '-') && matches!(next, '+' | '-') {
        return Some(glue);
    }

    // `/` followed by `/` or `*` would open a comment
    if prev == '/' && matches!(next, '/' | '*') {
        return Some(glue);
    }

    // `1 .toFixed()`
    if prev.is_ascii_digit() && next == '.' {
        return Some(glue);
    }

    if newline && !(BREAK_AFTER.contains(&prev) || BREAK_BEFORE.contains(&next)) {
        return Some('\n');
    }

    None
}

fn regex_allowed(out: &str) -> bool {
    let Some(prev) = out.chars().next_back() else {
        return true;
    };

    if is_word(prev) {
        let len: usize = out
            .chars()
            .rev()
            .take_while(|&c| is_word(c))
            .map(char::len_utf8)
            .sum();
        return KEYWORDS.contains(&&out[out.len() - len..]);
    }

    !matches!(prev, ')' | ']' | '}' | '"' | '\'' | '`')
}

pub fn minify_js(src: &str) -> String {
    minify_tracked(src).0
}

/// Generated and original position of a token, zero based. Only tokens that
/// start an output line or a new source line are recorded.
type Segment = ((u32, u32), (u32, u32));

#[derive(Default)]
struct Output {
    text: String,
    line: u32,
    column: u32,
}

impl Output {
    fn push(&mut self, c: char) {
        self.text.push(c);
        if c == '\n' {
            self.line += 1;
            self.column = 0;
        } else {
            self.column += 1;
        }
    }

    fn last(&self) -> Option<char> {
        self.text.chars().next_back()
    }
}

fn positions(chars: &[char]) -> Vec<(u32, u32)> {
    let mut acc = Vec::with_capacity(chars.len());
    let (mut line, mut column) = (0, 0);
    for &c in chars {
        acc.push((line, column));
        if c == '\n' {
            line += 1;
            column = 0;
        } else {
            column += 1;
        }
    }
    acc
}

fn minify_tracked(src: &str) -> (String, Vec<Segment>) {
    let chars: Vec<char> = src.chars().collect();
    let origin = positions(&chars);
    let mut out = Output {
        text: String::with_capacity(src.len()),
        ..Output::default()
    };
    let mut segments = Vec::new();
    let mut last: Option<(u32, u32)> = None;
    // whitespace seen since the last token, and whether it had a line break
    let mut pending: Option<bool> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if c.is_whitespace() {
            pending = Some(pending.unwrap_or(false) || c == '\n');
            i += 1;
            continue;
        }

        if c == '/' && next == Some('/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            pending = Some(pending.unwrap_or(false));
            continue;
        }

        if c == '/' && next == Some('*') {
            let mut newline = false;
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                newline |= chars[i] == '\n';
                i += 1;
            }
            i += 2;
            pending = Some(pending.unwrap_or(false) || newline);
            continue;
        }

        let is_regex = c == '/' && regex_allowed(&out.text);

        if let Some(newline) = pending.take()
            && let Some(prev) = out.last()
            && let Some(sep) = separator(prev, c, newline)
        {
            out.push(sep);
        }

        let start = i;
        i += 1;

        if matches!(c, '"' | '\'' | '`') {
            while i < chars.len() {
                let d = chars[i];
                i += 1;
                if d == '\\' {
                    i += 1;
                } else if d == c {
                    break;
                }
            }
        } else if is_regex {
            let mut class = false;
            while i < chars.len() {
                let d = chars[i];
                i += 1;
                match d {
                    '\\' => i += 1,
                    '[' => class = true,
                    ']' => class = false,
                    '/' if !class => break,
                    '\n' => break,
                    _ => {}
                }
            }
        }

        let original = origin[start];
        if last != Some((out.line, original.0)) {
            segments.push(((out.line, out.column), original));
            last = Some((out.line, original.0));
        }

        for &d in &chars[start..i.min(chars.len())] {
            out.push(d);
        }
    }

    (out.text, segments)
}

/// Runs an external minifier, the input goes to its stdin and the minified
/// code is read back from stdout.
#[derive(Debug, Clone)]
pub struct CommandMinifier {
    argv: Vec<String>,
}

impl CommandMinifier {
    /// Returns `None` for an empty command line.
    pub fn new(argv: Vec<String>) -> Option<Self> {
        (!argv.is_empty()).then_some(Self { argv })
    }
}

impl Minifier for CommandMinifier {
    fn minify(&self, name: &str, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        let (program, args) = self
            .argv
            .split_first()
            .context("empty minifier command")?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("couldn't start '{program}'"))?;

        let mut stdin = child.stdin.take().context("minifier stdin unavailable")?;

        // feed stdin from another thread so a full stdout pipe can't deadlock us
        let output = std::thread::scope(|s| {
            let writer = s.spawn(move || stdin.write_all(input));
            let output = child.wait_with_output();
            let written = writer.join();
            (output, written)
        });

        let output = match output {
            (Ok(output), Ok(_)) => output,
            (Err(e), _) => return Err(e).context(format!("'{program}' failed on {name}")),
            (_, Err(_)) => bail!("writer thread for '{program}' panicked"),
        };

        if !output.status.success() {
            bail!(
                "'{program}' exited with {} on {name}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::config::AssetClass;
    use crate::pipeline::Pipeline;
    use crate::pipeline::include::Include;
    use crate::pipeline::minify::Minify;
    use crate::pipeline::tests::{project, put};

    #[test]
    fn test_comments_and_whitespace() {
        let src = "// header\nfunction  add ( a, b ) {\n  /* sum */\n  return a + b;\n}\n";
        assert_eq!(minify_js(src), "function add(a,b){return a+b;}");
    }

    #[test]
    fn test_statement_breaks_are_kept() {
        assert_eq!(minify_js("foo()\nbar()\n"), "foo()\nbar()");
        assert_eq!(minify_js("let a = 1\nlet b = 2"), "let a=1\nlet b=2");
        assert_eq!(minify_js("x\n++y"), "x\n++y");
        assert_eq!(minify_js("return\nvalue"), "return\nvalue");
    }

    #[test]
    fn test_operators_do_not_merge() {
        assert_eq!(minify_js("a + +b"), "a+ +b");
        assert_eq!(minify_js("a - -b"), "a- -b");
    }

    #[test]
    fn test_literals_are_verbatim() {
        assert_eq!(minify_js("s = 'a  // b'"), "s='a  // b'");
        assert_eq!(minify_js("s = \"q \\\" /* x */\""), "s=\"q \\\" /* x */\"");
        assert_eq!(minify_js("t = `a  ${ b }  c`"), "t=`a  ${ b }  c`");
        assert_eq!(minify_js("r = /a  b\\/[/ ]/g;"), "r=/a  b\\/[/ ]/g;");
        assert_eq!(minify_js("return /x  y/.test(s)"), "return/x  y/.test(s)");
    }

    #[test]
    fn test_division_is_not_a_regex() {
        assert_eq!(minify_js("a = b / c / d"), "a=b/c/d");
        assert_eq!(minify_js("a / /re/.source"), "a/ /re/.source");
        assert_eq!(minify_js("1 .toFixed()"), "1 .toFixed()");
    }

    #[test]
    fn test_comment_separates_words() {
        assert_eq!(minify_js("var/**/x"), "var x");
    }

    #[test]
    fn test_never_longer() {
        let inputs = [
            "",
            " ",
            "a",
            "/* only a comment */",
            "if (a) {\n  b()\n} else {\n  c()\n}\n",
            "const re = /[/]/; const s = '\\'';",
            "x = 1 / 2 / 3",
            "label: for (;;) { break label }",
            "const ü = 'ö'  ;",
        ];

        for input in inputs {
            assert!(minify_js(input).len() <= input.len(), "{input:?}");
        }
    }

    #[test]
    fn test_script_pipeline() {
        let (_guard, root) = project();
        put(&root, "src/js/main.js", "//= lib.js\nmain(  );\n");
        put(&root, "src/js/lib.js", "function main() {\n  // hi\n  go();\n}\n");

        let pipeline = Pipeline::new(AssetClass::Script, &root, root.join("build/js"))
            .source("src/js/main.js")
            .stage(Include)
            .stage(Minify::new(JsMinifier));

        let written = pipeline.run().unwrap();
        assert_eq!(
            written,
            vec![root.join("build/js/main.js"), root.join("build/js/main.min.js")]
        );

        let full = fs::read_to_string(root.join("build/js/main.js")).unwrap();
        let min = fs::read_to_string(root.join("build/js/main.min.js")).unwrap();
        assert!(full.contains("// hi"));
        assert_eq!(min, "function main(){go();}\nmain();");
    }

    #[test]
    fn test_tokens_keep_their_lines() {
        let (out, segments) = minify_tracked("a();\n\n  b(  )\nc()");

        assert_eq!(out, "a();b()\nc()");
        assert_eq!(
            segments,
            vec![((0, 0), (0, 0)), ((0, 4), (2, 2)), ((1, 0), (3, 0))]
        );
    }

    #[test]
    fn test_command_minifier() {
        assert!(CommandMinifier::new(vec![]).is_none());

        let cat = CommandMinifier::new(vec!["cat".into()]).unwrap();
        assert_eq!(cat.minify("x.js", b"a();").unwrap(), b"a();");

        let missing = CommandMinifier::new(vec!["tsukuri-no-such-binary".into()]).unwrap();
        assert!(missing.minify("x.js", b"a();").is_err());
    }
}
