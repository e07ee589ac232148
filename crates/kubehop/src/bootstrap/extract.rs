//! Join credential recovery from `kubeadm` output.
//!
//! Each credential is recovered by an ordered [`Cascade`] of strategies. The
//! first candidate passing the cascade's acceptance check wins; every attempt
//! is recorded so a failed extraction can be diagnosed from the report.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Line echoed by the install script after `kubeadm` finished.
pub const INSTALL_SENTINEL: &str = "KUBEHOP_INSTALL_COMPLETE";

/// Sentence preceding the worker join command in `kubeadm init` output.
pub const JOIN_ANCHOR: &str = "join any number of worker nodes by running the following";

/// Lines scanned after [`JOIN_ANCHOR`].
pub const ANCHOR_CONTEXT_LINES: usize = 4;

/// Label printed by `kubeadm init --upload-certs` before the key.
pub const CERT_KEY_ANCHOR: &str = "Using certificate key:";

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--token\s+([a-z0-9]{6}\.[a-z0-9]{16})").expect("valid regex"));

static CA_HASH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"--discovery-token-ca-cert-hash\s+(sha256:[a-f0-9]{64})\b").expect("valid regex")
});

static BARE_HASH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"sha256:[a-f0-9]{64}\b").expect("valid regex"));

static ENDPOINT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"kubeadm join\s+(\S+)").expect("valid regex"));

static CERT_KEY_FLAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--certificate-key\s+([a-f0-9]{64})\b").expect("valid regex"));

static HEX64: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-f0-9]{64}$").expect("valid regex"));

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Credential needed to join a node to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedCredential {
    pub join_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_key: Option<String>,
}

/// One strategy evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    pub strategy: &'static str,
    pub matched: bool,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
}

/// Outcome of running both cascades over an install log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractionReport {
    pub join_command: Option<String>,
    pub certificate_key: Option<String>,
    pub attempts: Vec<Attempt>,
    /// Raw log lines that mention join or certificate material.
    pub candidate_lines: Vec<String>,
}

impl ExtractionReport {
    /// The recovered credential, if a join command was accepted.
    #[must_use]
    pub fn credential(&self) -> Option<ExtractedCredential> {
        self.join_command.as_ref().map(|join| ExtractedCredential {
            join_command: join.clone(),
            certificate_key: self.certificate_key.clone(),
        })
    }
}

/// A `(matcher, extractor)` pair.
pub struct Strategy {
    pub name: &'static str,
    pub matcher: fn(&str) -> bool,
    pub extractor: fn(&str) -> Option<String>,
}

/// Ordered strategies with a shared acceptance check.
pub struct Cascade {
    strategies: Vec<Strategy>,
    accept: fn(&str) -> bool,
}

impl Cascade {
    /// Worker join command cascade.
    #[must_use]
    pub fn join_command() -> Self {
        Self {
            strategies: vec![
                Strategy {
                    name: "join_anchor",
                    matcher: |log| log.contains(JOIN_ANCHOR),
                    extractor: join_after_anchor,
                },
                Strategy {
                    name: "join_last_line",
                    matcher: |log| log.contains("kubeadm join"),
                    extractor: join_last_line,
                },
                Strategy {
                    name: "join_fragments",
                    matcher: |log| log.contains("--token") || BARE_HASH.is_match(log),
                    extractor: join_from_fragments,
                },
            ],
            accept: accept_join_command,
        }
    }

    /// Control-plane certificate key cascade.
    #[must_use]
    pub fn certificate_key() -> Self {
        Self {
            strategies: vec![
                Strategy {
                    name: "cert_flag",
                    matcher: |log| log.contains("--certificate-key"),
                    extractor: cert_from_flag,
                },
                Strategy {
                    name: "cert_anchor",
                    matcher: |log| log.contains(CERT_KEY_ANCHOR),
                    extractor: cert_after_anchor,
                },
                Strategy {
                    name: "cert_bare_line",
                    matcher: |log| log.lines().any(|l| HEX64.is_match(l.trim())),
                    extractor: cert_bare_line,
                },
            ],
            accept: |candidate| HEX64.is_match(candidate),
        }
    }

    #[must_use]
    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name).collect()
    }

    /// Run the strategies in order, recording each into `attempts`.
    pub fn run(&self, log: &str, attempts: &mut Vec<Attempt>) -> Option<String> {
        for strategy in &self.strategies {
            if !(strategy.matcher)(log) {
                attempts.push(Attempt {
                    strategy: strategy.name,
                    matched: false,
                    accepted: false,
                    candidate: None,
                });
                continue;
            }

            let candidate = (strategy.extractor)(log);
            let accepted = candidate.as_deref().is_some_and(self.accept);
            attempts.push(Attempt {
                strategy: strategy.name,
                matched: true,
                accepted,
                candidate: candidate.clone(),
            });
            if accepted {
                return candidate;
            }
        }
        None
    }
}

/// Run the join and certificate-key cascades over `log`.
#[must_use]
pub fn extract(log: &str) -> ExtractionReport {
    let mut attempts = Vec::new();
    let join_command = Cascade::join_command().run(log, &mut attempts);
    let certificate_key = Cascade::certificate_key().run(log, &mut attempts);

    ExtractionReport {
        join_command,
        certificate_key,
        attempts,
        candidate_lines: candidate_lines(log),
    }
}

fn candidate_lines(log: &str) -> Vec<String> {
    log.lines()
        .map(str::trim)
        .filter(|l| {
            l.contains("kubeadm join")
                || l.contains("--token")
                || l.contains("--discovery-token-ca-cert-hash")
                || l.contains("certificate-key")
                || l.contains(CERT_KEY_ANCHOR)
                || HEX64.is_match(l)
        })
        .map(ToString::to_string)
        .collect()
}

/// Whether `candidate` is a usable worker join command.
#[must_use]
pub fn accept_join_command(candidate: &str) -> bool {
    candidate.starts_with("kubeadm join ") && TOKEN.is_match(candidate) && CA_HASH.is_match(candidate)
}

fn ends_with_continuation(line: &str) -> bool {
    line.trim_end().ends_with('\\')
}

/// Join `lines[start..]` while each line ends with a backslash, stopping
/// before `end`, and collapse whitespace.
fn continuation_block(lines: &[&str], start: usize, end: usize) -> String {
    let mut parts = Vec::new();
    for line in &lines[start..end.min(lines.len())] {
        let trimmed = line.trim_end();
        parts.push(trimmed.strip_suffix('\\').unwrap_or(trimmed));
        if !ends_with_continuation(line) {
            break;
        }
    }
    WHITESPACE.replace_all(parts.join(" ").trim(), " ").into_owned()
}

fn from_join(text: &str) -> Option<String> {
    text.find("kubeadm join").map(|i| text[i..].trim().to_string())
}

fn join_after_anchor(log: &str) -> Option<String> {
    let lines: Vec<&str> = log.lines().collect();
    let anchor = lines.iter().rposition(|l| l.contains(JOIN_ANCHOR))?;
    let window_end = anchor + 1 + ANCHOR_CONTEXT_LINES;
    let start = (anchor + 1..window_end.min(lines.len())).find(|&i| lines[i].contains("kubeadm join"))?;
    from_join(&continuation_block(&lines, start, window_end))
}

fn join_last_line(log: &str) -> Option<String> {
    let lines: Vec<&str> = log.lines().collect();
    lines
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, l)| l.contains("kubeadm join"))
        .map(|(i, _)| continuation_block(&lines, i, lines.len()))
        .find(|block| !block.contains("--control-plane"))
        .and_then(|block| from_join(&block))
}

fn join_from_fragments(log: &str) -> Option<String> {
    let endpoint = ENDPOINT.captures_iter(log).last()?.get(1)?.as_str().to_string();
    let token = TOKEN.captures_iter(log).last()?.get(1)?.as_str().to_string();
    let hash = match CA_HASH.captures_iter(log).last() {
        Some(caps) => caps.get(1)?.as_str().to_string(),
        None => BARE_HASH.find_iter(log).last()?.as_str().to_string(),
    };
    Some(format!(
        "kubeadm join {endpoint} --token {token} --discovery-token-ca-cert-hash {hash}"
    ))
}

fn cert_from_flag(log: &str) -> Option<String> {
    CERT_KEY_FLAG
        .captures_iter(log)
        .last()
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn cert_after_anchor(log: &str) -> Option<String> {
    let lines: Vec<&str> = log.lines().collect();
    let anchor = lines.iter().rposition(|l| l.contains(CERT_KEY_ANCHOR))?;

    // Same-line form: "[upload-certs] Using certificate key: <key>"
    let (_, rest) = lines[anchor].split_once(CERT_KEY_ANCHOR)?;
    if !rest.trim().is_empty() {
        return Some(rest.trim().to_string());
    }
    lines.get(anchor + 1).map(|l| l.trim().to_string())
}

fn cert_bare_line(log: &str) -> Option<String> {
    log.lines()
        .map(str::trim)
        .filter(|l| HEX64.is_match(l))
        .last()
        .map(ToString::to_string)
}
