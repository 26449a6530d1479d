// src/sys/identity.rs

//! Validation and quoting for the values that end up in the generated script
//! and in the key file name.

use regex::Regex;
use std::sync::LazyLock;

use crate::error::{Result, VerifyError};

/// POSIX-ish login names. No path separators, so `<user>.pem` stays in `.ssh`.
const SSH_USER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_.-]{0,31}$";

/// DNS names, IPv4 literals and bracketed IPv6 literals.
const REMOTE_HOST_PATTERN: &str =
    r"^(?:[A-Za-z0-9](?:[A-Za-z0-9.-]{0,251}[A-Za-z0-9])?|\[[0-9A-Fa-f:.]+\])$";

// Both patterns are constants; a failure here is a programming error.
static SSH_USER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(SSH_USER_PATTERN).expect("ssh user pattern compiles"));
static REMOTE_HOST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(REMOTE_HOST_PATTERN).expect("remote host pattern compiles"));

fn check(re: &Regex, value: &str, what: &str) -> Result<()> {
    if re.is_match(value) {
        Ok(())
    } else {
        Err(VerifyError::invalid_target(format!(
            "{what} '{}' contains characters that are not allowed",
            value.escape_default()
        )))
    }
}

pub fn validate_ssh_user(user: &str) -> Result<()> {
    check(&SSH_USER, user, "ssh user")?;
    if user.contains("..") {
        return Err(VerifyError::invalid_target("ssh user must not contain '..'"));
    }
    Ok(())
}

pub fn validate_remote_host(host: &str) -> Result<()> {
    check(&REMOTE_HOST, host, "remote host")
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(c, '_' | '-' | '.' | '/' | ':' | '@' | '%' | '+' | '=' | ',')
}

/// Quotes `word` for `/bin/sh`. Words made only of shell-safe characters are
/// returned unchanged; anything else is single-quoted.
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty() && word.chars().all(is_shell_safe) {
        return word.to_owned();
    }
    let mut quoted = String::with_capacity(word.len() + 2);
    quoted.push('\'');
    for c in word.chars() {
        if c == '\'' {
            quoted.push_str(r"'\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn patterns_compile_once_and_are_anchored() {
        assert_eq!(SSH_USER.as_str(), SSH_USER_PATTERN);
        assert_eq!(REMOTE_HOST.as_str(), REMOTE_HOST_PATTERN);
        assert!(!SSH_USER.is_match("deploy\nroot"));
        assert!(!REMOTE_HOST.is_match("10.0.0.5 extra"));
    }

    #[test]
    fn accepts_ordinary_identities() {
        validate_ssh_user("deploy").unwrap();
        validate_ssh_user("ec2-user").unwrap();
        validate_remote_host("10.0.0.5").unwrap();
        validate_remote_host("web-01.internal.example.com").unwrap();
        validate_remote_host("[fe80::1]").unwrap();
    }

    #[test]
    fn rejects_injection_and_traversal() {
        assert!(validate_ssh_user("../root").is_err());
        assert!(validate_ssh_user("a..b").is_err());
        assert!(validate_ssh_user("deploy; rm -rf /").is_err());
        assert!(validate_ssh_user("").is_err());
        assert!(validate_remote_host("-oProxyCommand=sh").is_err());
        assert!(validate_remote_host("host name").is_err());
        assert!(validate_remote_host("$(id)").is_err());
    }

    #[test]
    fn safe_words_pass_through() {
        assert_eq!(shell_quote("/ws/repo/test/recipes/"), "/ws/repo/test/recipes/");
        assert_eq!(shell_quote("ssh://deploy@10.0.0.5"), "ssh://deploy@10.0.0.5");
    }

    #[test]
    fn unsafe_words_are_single_quoted() {
        assert_eq!(shell_quote("/my repo"), "'/my repo'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    proptest! {
        #[test]
        fn quoted_words_never_expose_metacharacters(word in ".*") {
            let quoted = shell_quote(&word);
            if quoted == word {
                prop_assert!(word.chars().all(is_shell_safe));
            } else {
                prop_assert!(quoted.starts_with('\'') && quoted.ends_with('\''));
                // Outside of the '\'' escapes, no single quote may appear unpaired.
                let inner = &quoted[1..quoted.len() - 1];
                prop_assert_eq!(inner.replace(r"'\''", ""), word.replace('\'', ""));
            }
        }
    }
}
