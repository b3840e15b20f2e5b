//! POSIX shell helpers for building remote command lines.

use crate::error::{RemoteError, Result};

/// Quote a string as a single POSIX shell word.
pub fn quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-:=@,+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Wrap a command so it runs as root through non-interactive sudo.
pub fn sudo(command: &str) -> String {
    format!("sudo -n sh -c {}", quote(command))
}

/// Wrap a command for sudo reading the account password from stdin.
pub fn sudo_with_password(command: &str) -> String {
    format!("sudo -S -p '' sh -c {}", quote(command))
}

/// Reject paths that must never be handed to `rm -rf` or `mkdir -p`.
pub fn checked_path(path: &str) -> Result<&str> {
    let trimmed = path.trim_end_matches('/');
    if !path.starts_with('/') || trimmed.is_empty() || path.contains('\0') {
        return Err(RemoteError::InvalidPath(path.to_string()));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_plain_words() {
        assert_eq!(quote("/tmp/stage"), "/tmp/stage");
        assert_eq!(quote("user@host:22"), "user@host:22");
    }

    #[test]
    fn test_quote_special_characters() {
        assert_eq!(quote(""), "''");
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("it's"), "'it'\\''s'");
        assert_eq!(quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn test_sudo_wraps_whole_command() {
        assert_eq!(
            sudo("systemctl stop pg && rm -rf /data"),
            "sudo -n sh -c 'systemctl stop pg && rm -rf /data'"
        );
    }

    #[test]
    fn test_sudo_with_password_suppresses_prompt() {
        assert_eq!(
            sudo_with_password("systemctl start pg"),
            "sudo -S -p '' sh -c 'systemctl start pg'"
        );
    }

    #[test]
    fn test_checked_path() {
        assert!(checked_path("/tmp/stage").is_ok());
        assert!(checked_path("/").is_err());
        assert!(checked_path("//").is_err());
        assert!(checked_path("relative").is_err());
        assert!(checked_path("").is_err());
    }
}
