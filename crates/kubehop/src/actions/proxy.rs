//! `HAProxy` configuration file actions used by the backend patcher.
//!
//! Every action takes an optional `config_path` (defaults to
//! [`Settings::haproxy_config`]) and runs as root.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::password;
use crate::config::Settings;
use crate::params::{validate_remote_path, Params};
use crate::registry::{CommandRegistry, CommandTemplate};
use crate::shell::{heredoc, quote, sudo};

pub const PROXY_READ_CONFIG: &str = "proxyReadConfig";
pub const PROXY_BACKUP_CONFIG: &str = "proxyBackupConfig";
pub const PROXY_WRITE_CONFIG: &str = "proxyWriteConfig";
pub const PROXY_CHECK_CONFIG: &str = "proxyCheckConfig";
pub const PROXY_RESTORE_CONFIG: &str = "proxyRestoreConfig";
pub const PROXY_RESTART: &str = "proxyRestart";

/// Suffix between the config path and the backup timestamp.
pub const BACKUP_INFIX: &str = ".bak.";

/// Register the proxy file actions.
pub fn register(registry: &mut CommandRegistry, settings: &Settings) {
    let default_path = settings.haproxy_config.clone();

    let path_only = |action: &str, registry: &mut CommandRegistry, command: fn(&str) -> String| {
        let default_path = default_path.clone();
        let check = default_path.clone();
        registry.register(
            action,
            CommandTemplate::built(move |p| {
                let path = config_path(p, &default_path)?;
                Ok(vec![sudo(password(p), &command(&quote(path)))])
            })
            .validated(move |p| config_path(p, &check).map(|_| ())),
        );
    };

    path_only(PROXY_READ_CONFIG, registry, |path| format!("cat {path}"));
    path_only(PROXY_BACKUP_CONFIG, registry, |path| {
        format!(
            "BACKUP={path}'{BACKUP_INFIX}'\"$(date +%Y%m%d%H%M%S)\" && cp -p {path} \"$BACKUP\" && echo \"$BACKUP\""
        )
    });
    path_only(PROXY_CHECK_CONFIG, registry, |path| format!("haproxy -c -f {path}"));

    {
        let default_path = default_path.clone();
        let check = default_path.clone();
        registry.register(
            PROXY_WRITE_CONFIG,
            CommandTemplate::built(move |p| {
                let path = config_path(p, &default_path)?;
                Ok(vec![write_config(password(p), path, encoded_content(p)?)])
            })
            .validated(move |p| {
                config_path(p, &check)?;
                encoded_content(p).map(|_| ())
            }),
        );
    }

    {
        let default_path = default_path.clone();
        let check = default_path.clone();
        registry.register(
            PROXY_RESTORE_CONFIG,
            CommandTemplate::built(move |p| {
                let path = config_path(p, &default_path)?;
                let backup = backup_path(p, path)?;
                Ok(vec![sudo(password(p), &format!("cat {} > {}", quote(backup), quote(path)))])
            })
            .validated(move |p| {
                let path = config_path(p, &check)?;
                backup_path(p, path).map(|_| ())
            }),
        );
    }

    registry.register(
        PROXY_RESTART,
        CommandTemplate::built(|p| {
            Ok(vec![sudo(
                password(p),
                "systemctl restart haproxy || service haproxy restart",
            )])
        }),
    );
}

/// Stage the encoded content in a user-owned temp file through a heredoc,
/// then decode it into place as root. `$0` of the root shell is the staged file.
fn write_config(password: Option<&str>, path: &str, encoded: &str) -> String {
    let path = quote(path);
    let tmp = format!("{path}'.kubehop.tmp'");
    let install = sudo(
        password,
        &format!("base64 -d \"$0\" > {tmp} && cat {tmp} > {path} && rm -f {tmp}"),
    );
    format!(
        "STAGE=\"$(mktemp)\" && cat > \"$STAGE\" {}\n{install} \"$STAGE\"; rc=$?; rm -f \"$STAGE\"; exit $rc",
        heredoc(encoded)
    )
}

fn config_path<'a>(p: &'a Params, default: &'a str) -> Result<&'a str> {
    let path = p.optional_str("config_path").unwrap_or(default);
    validate_remote_path("config_path", path)?;
    Ok(path)
}

/// Base64 file content; must decode.
fn encoded_content(p: &Params) -> Result<&str> {
    let content = p.require_str("content")?.trim();
    STANDARD
        .decode(content)
        .context("parameter 'content' must be base64")?;
    Ok(content)
}

/// A backup made by `proxyBackupConfig` for `config_path`.
fn backup_path<'a>(p: &'a Params, config_path: &str) -> Result<&'a str> {
    let backup = p.require_str("backup_path")?.trim();
    validate_remote_path("backup_path", backup)?;
    let prefix = format!("{config_path}{BACKUP_INFIX}");
    if !backup.starts_with(&prefix) {
        bail!("backup '{backup}' is not a backup of {config_path}");
    }
    Ok(backup)
}
