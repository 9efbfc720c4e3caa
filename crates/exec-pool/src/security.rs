//! Pre-flight command validation
//!
//! Processes are always spawned without a shell, so metacharacters in
//! arguments are inert at the OS level. The check still runs before every
//! spawn so that injection attempts are rejected loudly instead of being
//! passed through to the engine binary.

use thiserror::Error;

/// Characters that carry meaning to a POSIX shell
const SHELL_METACHARACTERS: &[char] = &[';', '|', '&', '`', '$', '(', ')', '<', '>'];

/// Compound shell operators, reported separately from single characters
const SHELL_OPERATORS: &[&str] = &["||", "&&"];

/// Validation errors raised before a process is spawned
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Command path contains a `..` segment
    #[error("command contains a path traversal sequence: {command}")]
    PathTraversal { command: String },

    /// Command is empty or whitespace
    #[error("command must not be empty")]
    EmptyCommand,

    /// Argument contains a compound shell operator
    #[error("argument {index} contains shell operator '{operator}': {arg}")]
    ShellOperator {
        index: usize,
        operator: &'static str,
        arg: String,
    },

    /// Argument contains a shell metacharacter
    #[error("argument {index} contains shell metacharacter '{character}': {arg}")]
    ShellMetacharacter {
        index: usize,
        character: char,
        arg: String,
    },
}

/// Validate a command and its arguments.
///
/// Rejects a command containing `..` and any argument containing a shell
/// metacharacter (`;`, `|`, `&`, backtick, `$`, `(`, `)`, `<`, `>`) or one of
/// the operators `||` / `&&`. Has no side effects.
///
/// # Example
///
/// ```
/// use exec_pool::security::{validate_command, ValidationError};
///
/// assert!(validate_command("godot", &["--headless".to_string()]).is_ok());
/// assert!(matches!(
///     validate_command("godot", &["test || malware".to_string()]),
///     Err(ValidationError::ShellOperator { .. })
/// ));
/// ```
pub fn validate_command(command: &str, args: &[String]) -> Result<(), ValidationError> {
    if command.trim().is_empty() {
        return Err(ValidationError::EmptyCommand);
    }

    if command.contains("..") {
        return Err(ValidationError::PathTraversal {
            command: command.to_string(),
        });
    }

    for (index, arg) in args.iter().enumerate() {
        validate_arg(index, arg)?;
    }

    Ok(())
}

fn validate_arg(index: usize, arg: &str) -> Result<(), ValidationError> {
    // Operators first so "a || b" reports the operator, not the bare '|'
    if let Some(operator) = SHELL_OPERATORS.iter().find(|op| arg.contains(**op)) {
        return Err(ValidationError::ShellOperator {
            index,
            operator,
            arg: arg.to_string(),
        });
    }

    if let Some(character) = arg.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(ValidationError::ShellMetacharacter {
            index,
            character,
            arg: arg.to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_accepts_plain_invocation() {
        let result = validate_command(
            "/usr/local/bin/godot",
            &args(&["--headless", "--path", "/projects/game", "--export-release", "Linux"]),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_accepts_no_args() {
        assert!(validate_command("godot", &[]).is_ok());
    }

    #[test]
    fn test_rejects_empty_command() {
        assert_eq!(
            validate_command("  ", &[]),
            Err(ValidationError::EmptyCommand)
        );
    }

    #[test]
    fn test_rejects_path_traversal_in_command() {
        let err = validate_command("../../bin/sh", &[]).unwrap_err();
        assert!(matches!(err, ValidationError::PathTraversal { .. }));
    }

    #[test]
    fn test_path_traversal_only_checked_on_command() {
        // Relative project paths are legitimate arguments
        assert!(validate_command("godot", &args(&["--path", "../game"])).is_ok());
    }

    #[test]
    fn test_rejects_or_operator() {
        let err = validate_command("godot", &args(&["test || malware"])).unwrap_err();
        assert_eq!(
            err,
            ValidationError::ShellOperator {
                index: 0,
                operator: "||",
                arg: "test || malware".to_string(),
            }
        );
        assert!(err.to_string().contains("shell operator"));
    }

    #[test]
    fn test_rejects_and_operator() {
        let err = validate_command("godot", &args(&["--path", "a && rm -rf /"])).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::ShellOperator {
                index: 1,
                operator: "&&",
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_each_metacharacter() {
        for bad in ["a;b", "a|b", "a&b", "a`b`", "$HOME", "$(id)", "(x", "x)", "<in", ">out"] {
            let err = validate_command("godot", &args(&[bad])).unwrap_err();
            assert!(
                matches!(err, ValidationError::ShellMetacharacter { index: 0, .. }),
                "expected metacharacter rejection for {bad:?}, got {err:?}"
            );
        }
    }

    #[test]
    fn test_reports_first_offending_character() {
        let err = validate_command("godot", &args(&["ok", "x>y;z"])).unwrap_err();
        assert_eq!(
            err,
            ValidationError::ShellMetacharacter {
                index: 1,
                character: '>',
                arg: "x>y;z".to_string(),
            }
        );
    }

    #[test]
    fn test_allows_harmless_punctuation() {
        let result = validate_command(
            "godot",
            &args(&["--script=res://tools/build.gd", "key=value", "a,b", "--quit-after", "10"]),
        );
        assert!(result.is_ok());
    }
}
