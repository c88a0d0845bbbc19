use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use tracing::warn;

/// Why a candidate tool source was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenRejection {
    /// Short name of the rule that fired
    pub rule: &'static str,
    /// The offending text
    pub matched: String,
    /// 1-based source line
    pub line: usize,
}

impl fmt::Display for ScreenRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at line {}: '{}'", self.rule, self.line, self.matched)
    }
}

/// Static safety screen for generated tool sources
///
/// A generated tool is only registered after its source passes this screen.
/// The screen is conservative and purely lexical:
/// - every `import x` / `from x import ...` must name an allow-listed
///   top-level module
/// - dynamic evaluation, reflection, process spawning, networking, home or
///   environment lookups and destructive filesystem primitives are denied
///   outright
/// - writes whose target is an absolute, home or parent-relative literal
///   path are denied
/// - every `open(...)` in a writing mode must target a plain relative literal
///   or a name derived from `output_dir`, since tools may only write inside
///   the output directory they are handed at run time
///
/// Comment lines are ignored. The screen never executes the source.
///
/// # Example
///
/// ```
/// use shield_engine::generator::SandboxScreen;
///
/// let screen = SandboxScreen::new(&["numpy".to_string()]).unwrap();
/// assert!(screen.screen("import numpy as np\n").is_ok());
/// assert!(screen.screen("import socket\n").is_err());
/// ```
pub struct SandboxScreen {
    allowed: BTreeSet<String>,
    import: Regex,
    from_import: Regex,
    denied: Vec<(&'static str, Regex)>,
    writes: Vec<Regex>,
    open_call: Regex,
    assignment: Regex,
    escaping_literal: Regex,
    plain_literal: Regex,
    word: Regex,
}

const WRITE_RULE: &str = "write outside output directory";

impl SandboxScreen {
    /// Create a screen allowing imports of `allowed_imports` only
    ///
    /// # Errors
    ///
    /// Returns an error if a pattern fails to compile (never happens with the
    /// hardcoded patterns).
    pub fn new(allowed_imports: &[String]) -> anyhow::Result<Self> {
        let denied = vec![
            ("dynamic evaluation", Regex::new(r"\beval\s*\(")?),
            ("dynamic evaluation", Regex::new(r"\bexec\s*\(")?),
            ("dynamic evaluation", Regex::new(r"__import__\s*\(")?),
            ("dynamic evaluation", Regex::new(r"\bcompile\s*\(")?),
            ("reflection", Regex::new(r"\b(?:getattr|setattr|delattr|globals|locals|vars)\s*\(")?),
            (
                "reflection",
                Regex::new(r"__(?:builtins|subclasses|globals|dict|class|bases|mro|code|loader|spec)__")?,
            ),
            ("process spawn", Regex::new(r"\bsubprocess\b")?),
            ("process spawn", Regex::new(r"\bos\.system\s*\(")?),
            (
                "process spawn",
                Regex::new(r"\bos\.(?:popen|exec\w*|spawn\w*|posix_spawn\w*|fork\w*|kill\w*)\s*\(")?,
            ),
            ("file deletion", Regex::new(r"\bos\.(?:remove|unlink|rmdir|removedirs)\s*\(")?),
            ("file deletion", Regex::new(r"\bshutil\.rmtree\b")?),
            (
                "filesystem mutation",
                Regex::new(
                    r"\bos\.(?:rename|renames|replace|link|symlink|chmod|chown|truncate|open|fdopen|mkfifo|mknod)\s*\(",
                )?,
            ),
            ("filesystem mutation", Regex::new(r"\bshutil\b")?),
            ("home directory access", Regex::new(r"\bexpanduser\s*\(|\bPath\.home\s*\(")?),
            ("environment access", Regex::new(r"\bos\.environ\b|\bgetenv\s*\(")?),
            ("network access", Regex::new(r"\bsocket\b")?),
            ("network access", Regex::new(r"\brequests\b")?),
            ("network access", Regex::new(r"\burllib\b")?),
        ];

        let writes = vec![
            Regex::new(
                r#"\.(?:save|write|imwrite|export|write_text|write_bytes|touch|mkdir|makedirs|tofile|dump)\([^)\n]*?[rbufRBUF]{0,2}['"]((?:/|\.\.|~)[^'"]*)['"]"#,
            )?,
            Regex::new(
                r#"\bPath\(\s*[rbufRBUF]{0,2}['"]((?:/|\.\.|~)[^'"]*)['"]\s*\).*?\.(?:write_text|write_bytes|touch|mkdir|open|rename|replace|unlink|rmdir|symlink_to|hardlink_to|chmod)\s*\("#,
            )?,
        ];

        Ok(Self {
            allowed: allowed_imports.iter().map(|s| s.trim().to_string()).collect(),
            import: Regex::new(r"^\s*import\s+(.+)$")?,
            from_import: Regex::new(r"^\s*from\s+(\S+)\s+import\b")?,
            denied,
            writes,
            open_call: Regex::new(r"(?:^|[^\w.])open\s*\(")?,
            assignment: Regex::new(r"^\s*(\w+)\s*(?::[^=]+)?=([^=].*)$")?,
            escaping_literal: Regex::new(r#"['"](?:/|~)|\.\."#)?,
            plain_literal: Regex::new(r#"^[rbufRBUF]{0,2}['"]([^'"]*)['"]$"#)?,
            word: Regex::new(r"\w+")?,
        })
    }

    /// Screen a candidate source, returning the first rule it breaks
    pub fn screen(&self, source: &str) -> Result<(), ScreenRejection> {
        let result = self
            .first_violation(source)
            .and_then(|()| self.open_violation(source));
        if let Err(rejection) = &result {
            warn!(
                rule = rejection.rule,
                line = rejection.line,
                matched = %rejection.matched,
                "Generated source rejected by sandbox screen"
            );
        }
        result
    }

    fn first_violation(&self, source: &str) -> Result<(), ScreenRejection> {
        for (idx, raw) in source.lines().enumerate() {
            let line = idx + 1;
            if is_comment(raw) {
                continue;
            }

            for module in self.imported_modules(raw) {
                if !self.allowed.contains(&module) {
                    return Err(ScreenRejection {
                        rule: "import outside allow-list",
                        matched: module,
                        line,
                    });
                }
            }

            for (rule, pattern) in &self.denied {
                if let Some(m) = pattern.find(raw) {
                    return Err(ScreenRejection {
                        rule: *rule,
                        matched: m.as_str().to_string(),
                        line,
                    });
                }
            }

            for pattern in &self.writes {
                if let Some(caps) = pattern.captures(raw) {
                    let target = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                    return Err(ScreenRejection {
                        rule: WRITE_RULE,
                        matched: target.to_string(),
                        line,
                    });
                }
            }
        }
        Ok(())
    }

    /// Check every `open(...)` call that writes, including ones spanning lines
    fn open_violation(&self, source: &str) -> Result<(), ScreenRejection> {
        let code: String = source
            .lines()
            .map(|l| if is_comment(l) { "" } else { l })
            .collect::<Vec<_>>()
            .join("\n");
        let derived = self.output_dir_names(&code);

        for m in self.open_call.find_iter(&code) {
            let line = code[..m.end()].matches('\n').count() + 1;
            let Some(args) = call_args(&code[m.end()..]) else {
                return Err(ScreenRejection {
                    rule: WRITE_RULE,
                    matched: "unterminated open(".to_string(),
                    line,
                });
            };
            let args = split_top_level(args);
            let Some(target) = args.first().map(|a| a.trim()) else {
                continue;
            };
            if !self.opens_for_writing(&args) || self.is_inside_output(target, &derived) {
                continue;
            }
            let matched = match self.plain_literal.captures(target) {
                Some(caps) => caps[1].to_string(),
                None => target.to_string(),
            };
            return Err(ScreenRejection {
                rule: WRITE_RULE,
                matched,
                line,
            });
        }
        Ok(())
    }

    /// Whether an `open` call's mode writes; a mode that is not a literal counts
    fn opens_for_writing(&self, args: &[&str]) -> bool {
        let mode = args.iter().skip(1).find_map(|a| {
            let a = a.trim();
            match a.split_once('=') {
                Some((key, value)) if key.trim() == "mode" => Some(value.trim()),
                Some(_) => None,
                None => Some(a),
            }
        });
        match mode {
            None => false,
            Some(mode) => match self.plain_literal.captures(mode) {
                Some(caps) => caps[1].contains(['w', 'a', 'x', '+']),
                None => true,
            },
        }
    }

    fn is_inside_output(&self, target: &str, derived: &BTreeSet<String>) -> bool {
        if let Some(caps) = self.plain_literal.captures(target) {
            let path = &caps[1];
            return !path.is_empty()
                && !path.starts_with(['/', '~', '\\'])
                && !path.split(['/', '\\']).any(|part| part == "..");
        }
        !self.escaping_literal.is_match(target)
            && self.word.find_iter(target).any(|w| derived.contains(w.as_str()))
    }

    /// `output_dir` plus every name assigned from an expression using it
    fn output_dir_names(&self, code: &str) -> BTreeSet<String> {
        let mut names = BTreeSet::from(["output_dir".to_string()]);
        for raw in code.lines() {
            let Some(caps) = self.assignment.captures(raw) else {
                continue;
            };
            let value = &caps[2];
            if !self.escaping_literal.is_match(value)
                && self.word.find_iter(value).any(|w| names.contains(w.as_str()))
            {
                names.insert(caps[1].to_string());
            }
        }
        names
    }

    /// Top-level module names imported on one line
    fn imported_modules(&self, line: &str) -> Vec<String> {
        if let Some(caps) = self.from_import.captures(line) {
            return vec![root_module(&caps[1])];
        }
        let Some(caps) = self.import.captures(line) else {
            return Vec::new();
        };
        caps[1]
            .split(',')
            .filter_map(|item| item.split_whitespace().next())
            .map(root_module)
            .collect()
    }
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

/// Text between an opening paren (already consumed) and its partner
fn call_args(rest: &str) -> Option<&str> {
    let mut depth = 1usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in rest.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&rest[..i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split call arguments on commas outside brackets and strings
fn split_top_level(args: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in args.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&args[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if !args[start..].trim().is_empty() {
        parts.push(&args[start..]);
    }
    parts
}

/// `a.b.c` -> `a`; relative imports keep their leading dots and never match
fn root_module(path: &str) -> String {
    if path.starts_with('.') {
        return path.to_string();
    }
    path.split('.').next().unwrap_or(path).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn screen() -> SandboxScreen {
        let allowed: Vec<String> = ["numpy", "cv2", "json", "pathlib", "os", "tool_api", "registry"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        SandboxScreen::new(&allowed).unwrap()
    }

    const GOOD: &str = r#"
import json
import numpy as np, cv2
from pathlib import Path
from tool_api import PrivacyTool
from registry import register

class BlurPlates(PrivacyTool):
    name = "blur_plates"

    def apply(self, video_path, output_dir, **kwargs):
        out = Path(output_dir) / "plates.json"
        with open(out, "w") as f:
            json.dump({"ok": True}, f)
        return {"output_path": str(out)}

    def verify(self, **kwargs):
        return {"verified": True}

register(BlurPlates())
"#;

    #[test]
    fn test_clean_source_passes() {
        assert!(screen().screen(GOOD).is_ok());
    }

    #[test]
    fn test_import_outside_allow_list() {
        let err = screen().screen("import numpy\nimport shutil\n").unwrap_err();
        assert_eq!(err.rule, "import outside allow-list");
        assert_eq!(err.matched, "shutil");
        assert_eq!(err.line, 2);

        let err = screen().screen("from http.client import HTTPConnection\n").unwrap_err();
        assert_eq!(err.matched, "http");

        assert!(screen().screen("from . import helpers\n").is_err());
        assert!(screen().screen("import json, importlib\n").is_err());
    }

    #[test]
    fn test_submodule_of_allowed_root_passes() {
        assert!(screen().screen("import os.path\nfrom numpy.linalg import norm\n").is_ok());
    }

    #[test]
    fn test_dynamic_evaluation_denied() {
        for src in [
            "x = eval('1+1')",
            "exec (code)",
            "m = __import__('os')",
            "c = compile(src, 'x', 'exec')",
        ] {
            let err = screen().screen(src).unwrap_err();
            assert_eq!(err.rule, "dynamic evaluation", "{src}");
        }
    }

    #[test]
    fn test_process_network_and_deletion_denied() {
        assert_eq!(screen().screen("os.system('rm -rf /')").unwrap_err().rule, "process spawn");
        assert_eq!(screen().screen("os.remove(path)").unwrap_err().rule, "file deletion");
        assert_eq!(screen().screen("s = socket").unwrap_err().rule, "network access");
    }

    #[test]
    fn test_absolute_and_parent_writes_denied() {
        let err = screen()
            .screen("with open('/etc/passwd', 'w') as f:\n    pass\n")
            .unwrap_err();
        assert_eq!(err.rule, "write outside output directory");
        assert_eq!(err.matched, "/etc/passwd");

        assert!(screen().screen("open(\"../escape.txt\", mode='ab')").is_err());
        assert!(screen().screen("cv2.imwrite('/tmp/frame.png', img)").is_err());
        assert!(screen().screen("audio.export(\"../../out.wav\")").is_err());
    }

    #[test]
    fn test_reads_and_relative_writes_pass() {
        assert!(screen().screen("data = open('/data/in.json', 'r').read()").is_ok());
        assert!(screen().screen("img.save(str(out))").is_ok());
    }

    #[test]
    fn test_call_args_respect_nesting_and_strings() {
        let rest = "os.path.join(output_dir, 'a,b)'), mode='w') as f:";
        let args = call_args(rest).unwrap();
        assert_eq!(args, "os.path.join(output_dir, 'a,b)'), mode='w'");
        assert_eq!(
            split_top_level(args),
            vec!["os.path.join(output_dir, 'a,b)')", " mode='w'"]
        );
        assert!(call_args("unterminated, 'w'").is_none());
    }

    #[test]
    fn test_names_derived_from_output_dir() {
        let names = screen().output_dir_names(
            "out = Path(output_dir) / 'x.png'\nframe = out.with_suffix('.jpg')\nbad = out + '/../y'\nother = 3\n",
        );
        assert!(names.contains("out"));
        assert!(names.contains("frame"));
        assert!(!names.contains("bad"));
        assert!(!names.contains("other"));
    }

    #[test]
    fn test_comment_lines_ignored() {
        assert!(screen().screen("# never use eval( or subprocess here\nimport json\n").is_ok());
    }
}
