//! Pre-execution checks on submitted code and variable names.
//!
//! The isolate is the boundary; these checks only keep oversized input out of
//! V8 and decide which variables can be bound by name.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::SandboxError;

/// Maximum code size in bytes (64 KB).
pub const DEFAULT_MAX_CODE_SIZE: usize = 64 * 1024;

static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").unwrap());

/// Words that cannot name a parameter of a strict-mode function.
const RESERVED_WORDS: &[&str] = &[
    "arguments", "await", "break", "case", "catch", "class", "const", "continue", "debugger",
    "default", "delete", "do", "else", "enum", "eval", "export", "extends", "false", "finally",
    "for", "function", "if", "implements", "import", "in", "instanceof", "interface", "let",
    "new", "null", "package", "private", "protected", "public", "return", "static", "super",
    "switch", "this", "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield",
];

/// Names the evaluator binds itself; variables with these names stay reachable
/// only through `variables[...]`.
pub const RESERVED_BINDINGS: &[&str] = &["variables", "console", "env"];

/// Reject code over `max_size` bytes. Empty code is valid and evaluates to `undefined`.
pub fn validate_code(code: &str, max_size: Option<usize>) -> Result<(), SandboxError> {
    let max = max_size.unwrap_or(DEFAULT_MAX_CODE_SIZE);
    if code.len() > max {
        return Err(SandboxError::CodeTooLarge {
            max,
            actual: code.len(),
        });
    }
    Ok(())
}

/// Whether `name` can be introduced as a strict-mode parameter.
pub fn is_bindable_identifier(name: &str) -> bool {
    IDENTIFIER_RE.is_match(name) && !RESERVED_WORDS.contains(&name)
}

/// Variable names that get their own binding, in map order.
pub fn bindable_names(variables: &Map<String, Value>) -> Vec<&str> {
    variables
        .keys()
        .map(String::as_str)
        .filter(|name| is_bindable_identifier(name) && !RESERVED_BINDINGS.contains(name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_empty_code() {
        assert!(validate_code("", None).is_ok());
    }

    #[test]
    fn rejects_oversized_code() {
        let big = "x".repeat(100_000);
        let err = validate_code(&big, None).unwrap_err();
        assert!(matches!(err, SandboxError::CodeTooLarge { .. }));
    }

    #[test]
    fn custom_max_size() {
        let code = "x".repeat(100);
        assert!(validate_code(&code, Some(50)).is_err());
        assert!(validate_code(&code, Some(200)).is_ok());
    }

    #[test]
    fn plain_identifiers_are_bindable() {
        for name in ["x", "_private", "$el", "camelCase", "a1"] {
            assert!(is_bindable_identifier(name), "{name}");
        }
    }

    #[test]
    fn non_identifiers_are_not_bindable() {
        for name in ["", "1x", "my-var", "a b", "café", "class", "eval", "arguments", "let"] {
            assert!(!is_bindable_identifier(name), "{name}");
        }
    }

    #[test]
    fn reserved_bindings_are_skipped() {
        let variables = serde_json::json!({
            "name": "x",
            "console": 1,
            "variables": 2,
            "env": 3,
            "user-id": 4,
        });
        let names = bindable_names(variables.as_object().unwrap());
        assert_eq!(names, vec!["name"]);
    }
}
