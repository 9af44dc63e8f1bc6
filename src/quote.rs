//! Shell quoting and template interpolation.
//!
//! Interpolated values are the only user-controlled data that ever reaches a
//! shell, so this module is the single injection defense of the crate: after
//! [`interpolate`] no interpolated value can terminate its quoting context or
//! smuggle in metacharacters the caller did not type in the literal parts.
//! Every adapter that hands a string to a shell goes through these functions
//! first.

use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;

/// Replacement escape used uniformly when a caller installs a custom quoter
/// on the engine.
pub type QuoteFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Characters that never need quoting on a POSIX host.
static SAFE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_./:=@-]+$").expect("static pattern"));

/// Escape a single string for a POSIX shell.
///
/// Strings made only of safe characters pass through verbatim. Everything
/// else is wrapped in `$'…'` ANSI-C quoting, which survives embedded single
/// quotes and preserves control characters. The empty string renders as
/// `$''` so it still counts as one argument.
pub fn escape_unix(value: &str) -> String {
    if SAFE_PATTERN.is_match(value) {
        return value.to_string();
    }

    let mut out = String::with_capacity(value.len() + 4);
    out.push_str("$'");
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\u{c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{b}' => out.push_str("\\v"),
            '\0' => out.push_str("\\0"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

/// Escape a single string for `cmd.exe` argument parsing.
///
/// Strings containing whitespace, `"`, or `\` are wrapped in double quotes;
/// backslash runs preceding a double quote are doubled, as is a trailing
/// backslash run, so the quoted form round-trips through the MSVCRT rules.
pub fn escape_windows(value: &str) -> String {
    if !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\\')
    {
        return value.to_string();
    }

    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    let mut backslashes = 0usize;
    for ch in value.chars() {
        match ch {
            '\\' => backslashes += 1,
            '"' => {
                out.extend(std::iter::repeat_n('\\', backslashes * 2 + 1));
                out.push('"');
                backslashes = 0;
            }
            other => {
                out.extend(std::iter::repeat_n('\\', backslashes));
                out.push(other);
                backslashes = 0;
            }
        }
    }
    out.extend(std::iter::repeat_n('\\', backslashes * 2));
    out.push('"');
    out
}

/// Escape a single string for the current host's shell.
#[cfg(windows)]
pub fn escape(value: &str) -> String {
    escape_windows(value)
}

/// Escape a single string for the current host's shell.
#[cfg(not(windows))]
pub fn escape(value: &str) -> String {
    escape_unix(value)
}

/// A value interpolated into a command template.
///
/// Scalars render in their natural form, sequences render element-escaped and
/// space-joined, and [`ShellValue::Absent`] contributes nothing to the final
/// string.
#[derive(Debug, Clone, PartialEq)]
pub enum ShellValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<ShellValue>),
    Absent,
}

impl ShellValue {
    /// Render this value with the given escape function.
    pub fn render(&self, escape: &dyn Fn(&str) -> String) -> String {
        match self {
            ShellValue::Str(s) => escape(s),
            ShellValue::Int(n) => n.to_string(),
            ShellValue::Float(f) => f.to_string(),
            ShellValue::Bool(b) => b.to_string(),
            ShellValue::List(items) => items
                .iter()
                .map(|item| item.render(escape))
                .collect::<Vec<_>>()
                .join(" "),
            ShellValue::Absent => String::new(),
        }
    }
}

impl From<&str> for ShellValue {
    fn from(value: &str) -> Self {
        ShellValue::Str(value.to_string())
    }
}

impl From<String> for ShellValue {
    fn from(value: String) -> Self {
        ShellValue::Str(value)
    }
}

impl From<i64> for ShellValue {
    fn from(value: i64) -> Self {
        ShellValue::Int(value)
    }
}

impl From<i32> for ShellValue {
    fn from(value: i32) -> Self {
        ShellValue::Int(i64::from(value))
    }
}

impl From<u32> for ShellValue {
    fn from(value: u32) -> Self {
        ShellValue::Int(i64::from(value))
    }
}

impl From<f64> for ShellValue {
    fn from(value: f64) -> Self {
        ShellValue::Float(value)
    }
}

impl From<bool> for ShellValue {
    fn from(value: bool) -> Self {
        ShellValue::Bool(value)
    }
}

impl<T: Into<ShellValue>> From<Vec<T>> for ShellValue {
    fn from(values: Vec<T>) -> Self {
        ShellValue::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<ShellValue>> From<Option<T>> for ShellValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(ShellValue::Absent, Into::into)
    }
}

/// Stitch literal template parts and escaped values into one command string.
///
/// For `N` literal parts there must be exactly `N - 1` values; anything else
/// is a programmer error and panics.
pub fn interpolate(parts: &[&str], values: &[ShellValue]) -> String {
    interpolate_with(parts, values, &escape)
}

/// [`interpolate`] with a caller-supplied escape, used when the engine
/// carries a custom quoter.
pub fn interpolate_with(
    parts: &[&str],
    values: &[ShellValue],
    escape: &dyn Fn(&str) -> String,
) -> String {
    assert_eq!(
        parts.len(),
        values.len() + 1,
        "template needs exactly one more literal part than values"
    );

    let mut out = String::new();
    for (i, part) in parts.iter().enumerate() {
        out.push_str(part);
        if let Some(value) = values.get(i) {
            out.push_str(&value.render(escape));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_strings_pass_through() {
        assert_eq!(escape_unix("abc"), "abc");
        assert_eq!(escape_unix("a/b.c:d=e@f-g_h"), "a/b.c:d=e@f-g_h");
    }

    #[test]
    fn unsafe_strings_use_ansi_c_quoting() {
        assert_eq!(escape_unix("my file.txt"), "$'my file.txt'");
        assert_eq!(escape_unix("a'b"), "$'a\\'b'");
        assert_eq!(escape_unix("a\nb"), "$'a\\nb'");
        assert_eq!(escape_unix("a\\b"), "$'a\\\\b'");
        assert_eq!(escape_unix(""), "$''");
    }

    #[test]
    fn injection_attempt_stays_inert() {
        let dangerous = "'; rm -rf /; echo '";
        let escaped = escape_unix(dangerous);
        assert!(escaped.starts_with("$'"));
        assert!(escaped.ends_with('\''));
        // The embedded quotes are all backslash-escaped, so the quoting
        // context cannot be terminated early.
        assert!(!escaped.contains("''"));
    }

    #[test]
    fn windows_quoting_doubles_backslashes_before_quotes() {
        assert_eq!(escape_windows("plain"), "plain");
        assert_eq!(escape_windows("two words"), "\"two words\"");
        assert_eq!(escape_windows("a\"b"), "\"a\\\"b\"");
        assert_eq!(escape_windows("end\\"), "\"end\\\\\"");
    }

    #[test]
    fn scalars_render_unquoted() {
        assert_eq!(ShellValue::from(42i64).render(&escape_unix), "42");
        assert_eq!(ShellValue::from(true).render(&escape_unix), "true");
        assert_eq!(ShellValue::from(1.5f64).render(&escape_unix), "1.5");
    }

    #[test]
    fn lists_join_with_spaces_and_empty_lists_vanish() {
        let list = ShellValue::from(vec!["a b", "c"]);
        assert_eq!(list.render(&escape_unix), "$'a b' c");
        let empty: Vec<&str> = Vec::new();
        assert_eq!(ShellValue::from(empty).render(&escape_unix), "");
    }

    #[test]
    fn interpolation_orders_parts_and_values() {
        let out = interpolate(
            &["echo ", " > ", ""],
            &["hello world".into(), "out.txt".into()],
        );
        assert_eq!(out, "echo $'hello world' > out.txt");
    }

    #[test]
    fn absent_contributes_nothing() {
        let out = interpolate(&["echo ", ""], &[ShellValue::Absent]);
        assert_eq!(out, "echo ");
    }

    #[test]
    #[should_panic(expected = "one more literal part")]
    fn arity_mismatch_panics() {
        interpolate(&["echo "], &["x".into()]);
    }

    #[test]
    fn custom_quoter_overrides_escape() {
        let upper = |s: &str| format!("<{s}>");
        let out = interpolate_with(&["echo ", ""], &["hi there".into()], &upper);
        assert_eq!(out, "echo <hi there>");
    }
}
