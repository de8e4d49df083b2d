//! Port and error-signal parsing from dev-server output.

use super::types::PortMatch;
use regex::Regex;
use std::sync::LazyLock;
use tracing::warn;

/// Bumped whenever `DEFAULT_PORT_PATTERNS` changes.
pub const PORT_PATTERNS_VERSION: u32 = 1;

/// Built-in port patterns, highest priority first. Capture group 1 is the port.
///
/// 0. loopback URL with a scheme: `http://localhost:5173/`, `http://127.0.0.1:8000`
/// 1. `listening on port 3000`, `Listening at 8080`, `listening on :9000`
/// 2. `running on port 3000`
/// 3. bare loopback host:port: `0.0.0.0:4000`
pub const DEFAULT_PORT_PATTERNS: &[&str] = &[
    r"(?i)https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1?\]):(\d+)",
    r"(?i)\blistening\s+(?:on|at)\s+(?:port\s+|:)?(\d+)\b",
    r"(?i)\bon\s+port\s+:?(\d+)\b",
    r"(?i)\b(?:localhost|127\.0\.0\.1|0\.0\.0\.0):(\d+)\b",
];

static ANSI_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").unwrap());

static ERROR_SIGNAL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(error\b|err!|\bfatal\b|exception\b|\bpanic|\beaddrinuse\b)").unwrap()
});

static ACCESS_TOKEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(x-access-token:)[^@\s]+@").unwrap());

static URL_USERINFO_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(https?://)[^/\s:@]+:[^@\s]+@").unwrap());

/// Remove terminal color/cursor escapes.
pub fn strip_ansi(text: &str) -> std::borrow::Cow<'_, str> {
    ANSI_REGEX.replace_all(text, "")
}

/// Ordered, compiled port patterns.
///
/// Patterns may come from user configuration, so compile failures are
/// logged and the pattern is skipped rather than failing the caller.
#[derive(Debug, Clone)]
pub struct PortPatterns {
    compiled: Vec<Regex>,
    rejected: Vec<String>,
}

impl PortPatterns {
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Self {
        let mut compiled = Vec::with_capacity(patterns.len());
        let mut rejected = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            match Regex::new(pattern) {
                Ok(re) => compiled.push(re),
                Err(e) => {
                    warn!(pattern, error = %e, "Skipping invalid port pattern");
                    rejected.push(pattern.to_string());
                }
            }
        }
        Self { compiled, rejected }
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }

    /// Patterns that failed to compile, in input order.
    pub fn rejected(&self) -> &[String] {
        &self.rejected
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.compiled.iter().map(Regex::as_str)
    }

    /// First in-range port found by the highest-priority pattern that
    /// yields one. Out-of-range captures are skipped and the scan goes on.
    pub fn match_port(&self, text: &str) -> Option<PortMatch> {
        let text = strip_ansi(text);
        for (index, re) in self.compiled.iter().enumerate() {
            for caps in re.captures_iter(&text) {
                let Some(group) = caps.get(1) else {
                    continue;
                };
                let Ok(port) = group.as_str().parse::<u32>() else {
                    continue;
                };
                if (1..=65535).contains(&port) {
                    return Some(PortMatch {
                        port: port as u16,
                        pattern_index: index,
                        matched_text: caps
                            .get(0)
                            .map(|m| m.as_str().to_string())
                            .unwrap_or_default(),
                    });
                }
            }
        }
        None
    }
}

impl Default for PortPatterns {
    fn default() -> Self {
        Self::compile(DEFAULT_PORT_PATTERNS)
    }
}

/// Convenience wrapper over [`PortPatterns::match_port`].
pub fn match_port(text: &str, patterns: &PortPatterns) -> Option<PortMatch> {
    patterns.match_port(text)
}

/// Whether `text` looks like it reports an error.
pub fn has_error_signal(text: &str) -> bool {
    ERROR_SIGNAL_REGEX.is_match(&strip_ansi(text))
}

/// Lines of `text` that carry an error signal, ANSI escapes removed.
pub fn error_lines(text: &str) -> Vec<String> {
    strip_ansi(text)
        .lines()
        .filter(|line| ERROR_SIGNAL_REGEX.is_match(line))
        .map(|line| line.trim().to_string())
        .collect()
}

/// Mask `token` and any URL-embedded credentials in `text`.
pub fn redact_credentials(text: &str, token: Option<&str>) -> String {
    let mut out = match token {
        Some(t) if !t.is_empty() => text.replace(t, "***"),
        _ => text.to_string(),
    };
    out = ACCESS_TOKEN_REGEX.replace_all(&out, "${1}***@").into_owned();
    URL_USERINFO_REGEX.replace_all(&out, "${1}***@").into_owned()
}
