//! Input validation and allow-lists gating every user-derived string that
//! reaches a remote argv — every command is built as an argv list, never
//! a shell string, so these checks are the only thing standing between a
//! malicious field and a remote shell.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::RangeError;

fn username_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.-]{1,32}$").unwrap())
}

pub const PACKAGE_MANAGERS: &[&str] =
    &["apt", "apt-get", "yum", "dnf", "zypper", "chocolatey", "brew"];

pub const INTERPRETERS: &[&str] = &[
    "python", "python3", "bash", "sh", "powershell", "cmd", "java", "node",
];

pub fn validate_username(username: &str) -> Result<(), RangeError> {
    if username_re().is_match(username) {
        Ok(())
    } else {
        Err(RangeError::Validation {
            message: format!(
                "username '{username}' does not match ^[A-Za-z0-9_.-]{{1,32}}$"
            ),
        })
    }
}

pub fn validate_package_manager(manager: &str) -> Result<(), RangeError> {
    if PACKAGE_MANAGERS.contains(&manager) {
        Ok(())
    } else {
        Err(RangeError::Validation {
            message: format!(
                "package manager '{manager}' is not in the allow-list {PACKAGE_MANAGERS:?}"
            ),
        })
    }
}

pub fn validate_interpreter(interpreter: &str) -> Result<(), RangeError> {
    if INTERPRETERS.contains(&interpreter) {
        Ok(())
    } else {
        Err(RangeError::Validation {
            message: format!(
                "interpreter '{interpreter}' is not in the allow-list {INTERPRETERS:?}"
            ),
        })
    }
}

const FORBIDDEN_PATH_SEQUENCES: &[&str] = &["..", "`", "$(", "|", ";", "&&"];

/// Rejects paths containing traversal or shell metacharacters so they are
/// safe to pass as a single argv element to a copy helper script.
pub fn validate_path_arg(path: &str) -> Result<(), RangeError> {
    if path.is_empty() {
        return Err(RangeError::Validation {
            message: "path must not be empty".into(),
        });
    }
    for seq in FORBIDDEN_PATH_SEQUENCES {
        if path.contains(seq) {
            return Err(RangeError::Validation {
                message: format!("path '{path}' contains forbidden sequence '{seq}'"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_usernames() {
        for name in ["alice", "bob.smith", "user_01", "a-b-c"] {
            validate_username(name).unwrap();
        }
    }

    #[test]
    fn rejects_invalid_usernames() {
        for name in ["", "bob smith", "user;rm -rf", "../etc", "a".repeat(33).as_str()] {
            assert!(validate_username(name).is_err());
        }
    }

    #[test]
    fn rejects_unknown_package_manager() {
        assert!(validate_package_manager("pacman").is_err());
        validate_package_manager("apt-get").unwrap();
    }

    #[test]
    fn rejects_unknown_interpreter() {
        assert!(validate_interpreter("perl").is_err());
        validate_interpreter("python3").unwrap();
    }

    #[test]
    fn rejects_path_traversal_and_injection() {
        assert!(validate_path_arg("../../etc/passwd").is_err());
        assert!(validate_path_arg("/tmp/$(whoami)").is_err());
        assert!(validate_path_arg("/tmp/a; rm -rf /").is_err());
        validate_path_arg("/tmp/safe/path.txt").unwrap();
    }
}
