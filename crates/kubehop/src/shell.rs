//! Shell quoting and command composition helpers.
//!
//! Every command built by the registrars is a single `bash` line executed on
//! the final hop, so all interpolated values go through [`quote`].

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::{NoExpand, Regex};

/// Heredoc delimiter used when writing files on the remote host.
pub const HEREDOC_DELIMITER: &str = "KUBEHOP_EOF";

/// Stand-in for a sudo password in displayed commands.
pub const REDACTED: &str = "'***'";

/// The password prefix produced by [`sudo`].
static SUDO_PASSWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"printf '%s\\n' '(?:[^']|'\\'')*' \| sudo -S").expect("valid regex")
});

/// Quote a value for use as a single shell word.
///
/// The value is wrapped in single quotes and embedded single quotes are
/// replaced by `'\''`.
#[must_use]
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Run `script` through `bash -c` as root.
///
/// With a password the password is piped to `sudo -S`; without one `sudo -n`
/// is used so a missing sudoers entry fails instead of prompting.
#[must_use]
pub fn sudo(password: Option<&str>, script: &str) -> String {
    match password.filter(|p| !p.is_empty()) {
        Some(password) => format!(
            "printf '%s\\n' {} | sudo -S -p '' bash -c {}",
            quote(password),
            quote(script)
        ),
        None => format!("sudo -n bash -c {}", quote(script)),
    }
}

/// Replace the sudo password in `command` with [`REDACTED`].
#[must_use]
pub fn redact(command: &str) -> Cow<'_, str> {
    SUDO_PASSWORD.replace_all(command, NoExpand(&format!("printf '%s\\n' {REDACTED} | sudo -S")))
}

/// A quoted heredoc feeding `content` verbatim to the preceding command.
#[must_use]
pub fn heredoc(content: &str) -> String {
    let body = content.strip_suffix('\n').unwrap_or(content);
    format!("<<'{HEREDOC_DELIMITER}'\n{body}\n{HEREDOC_DELIMITER}")
}

/// Write `content` verbatim to `path` using a quoted heredoc.
#[must_use]
pub fn write_file(path: &str, content: &str) -> String {
    format!("cat > {} {}", quote(path), heredoc(content))
}

/// Start `command` in its own session so it survives the SSH channel closing.
///
/// Output goes to `log_path`; the spawned pid is written to `pid_path`.
#[must_use]
pub fn detach(command: &str, log_path: &str, pid_path: &str) -> String {
    format!(
        "setsid nohup {command} > {} 2>&1 < /dev/null & echo $! > {}",
        quote(log_path),
        quote(pid_path)
    )
}

/// Append `|| true` so a teardown step never fails the shell.
#[must_use]
pub fn tolerant(command: &str) -> String {
    format!("{command} || true")
}
