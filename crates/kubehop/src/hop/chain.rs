//! Chaining logic independent of the SSH transport.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{CommandResult, HopDescriptor, HopExecutor};

/// Output of one command as reported by a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

/// An authenticated connection to one hop.
#[async_trait]
pub trait HopSession: Send + Sync {
    /// Open a forwarded channel to `next` through this session and
    /// authenticate on it.
    async fn tunnel(&self, next: &HopDescriptor) -> anyhow::Result<Box<dyn HopSession>>;

    /// Run one command and collect its output.
    async fn exec(&self, command: &str) -> anyhow::Result<RawOutput>;

    /// Disconnect. Errors are ignored.
    async fn close(&self);
}

/// Opens the first hop of a chain.
#[async_trait]
pub trait HopDialer: Send + Sync {
    async fn dial(&self, hop: &HopDescriptor) -> anyhow::Result<Box<dyn HopSession>>;
}

/// Failure of a chain execution.
///
/// Carries the results of the commands that completed before the failure.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct ChainError {
    message: String,
    completed: Vec<CommandResult>,
}

impl ChainError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            completed: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_completed(mut self, completed: Vec<CommandResult>) -> Self {
        self.completed = completed;
        self
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn completed(&self) -> &[CommandResult] {
        &self.completed
    }

    #[must_use]
    pub fn into_completed(self) -> Vec<CommandResult> {
        self.completed
    }
}

/// [`HopExecutor`] that walks a hop chain through a [`HopDialer`].
pub struct ChainExecutor<D> {
    dialer: D,
}

impl<D: HopDialer> ChainExecutor<D> {
    pub fn new(dialer: D) -> Self {
        Self { dialer }
    }

    async fn open_chain(&self, hops: &[HopDescriptor]) -> Result<Vec<Box<dyn HopSession>>, ChainError> {
        let mut sessions: Vec<Box<dyn HopSession>> = Vec::with_capacity(hops.len());

        for (index, hop) in hops.iter().enumerate() {
            let opened = match sessions.last() {
                None => self.dialer.dial(hop).await,
                Some(previous) => previous.tunnel(hop).await,
            };

            match opened {
                Ok(session) => {
                    debug!(hop = index + 1, endpoint = %hop, "hop connected");
                    sessions.push(session);
                }
                Err(e) => {
                    close_all(&sessions).await;
                    return Err(ChainError::new(format!(
                        "failed to connect to hop {} of {} ({hop}): {e:#}",
                        index + 1,
                        hops.len()
                    )));
                }
            }
        }

        Ok(sessions)
    }

    async fn run(
        &self,
        hops: &[HopDescriptor],
        commands: &[String],
        results: &mut Vec<CommandResult>,
    ) -> Result<(), ChainError> {
        let sessions = self.open_chain(hops).await?;
        let Some(target) = sessions.last() else {
            return Err(ChainError::new("hop chain is empty"));
        };

        for (index, command) in commands.iter().enumerate() {
            debug!(index, len = command.len(), "executing command");
            let started = Instant::now();

            match target.exec(command).await {
                Ok(output) => {
                    debug!(index, exit_status = output.exit_status, "command finished");
                    results.push(CommandResult {
                        command: command.clone(),
                        stdout: output.stdout,
                        stderr: output.stderr,
                        exit_status: output.exit_status,
                        elapsed: started.elapsed(),
                        error: None,
                    });
                }
                Err(e) => {
                    let message = format!("{e:#}");
                    warn!(index, error = %message, "command failed to execute");
                    results.push(CommandResult {
                        command: command.clone(),
                        stdout: String::new(),
                        stderr: String::new(),
                        exit_status: -1,
                        elapsed: started.elapsed(),
                        error: Some(message.clone()),
                    });
                    close_all(&sessions).await;
                    return Err(ChainError::new(format!(
                        "command {} failed: {message}",
                        index + 1
                    )));
                }
            }
        }

        close_all(&sessions).await;
        Ok(())
    }
}

async fn close_all(sessions: &[Box<dyn HopSession>]) {
    for session in sessions.iter().rev() {
        session.close().await;
    }
}

#[async_trait]
impl<D: HopDialer> HopExecutor for ChainExecutor<D> {
    async fn execute(
        &self,
        hops: &[HopDescriptor],
        commands: &[String],
        timeout: Duration,
    ) -> Result<Vec<CommandResult>, ChainError> {
        if hops.is_empty() {
            return Err(ChainError::new("hop chain is empty"));
        }

        info!(hops = hops.len(), commands = commands.len(), "executing on hop chain");
        let mut results = Vec::with_capacity(commands.len());
        let outcome = tokio::time::timeout(timeout, self.run(hops, commands, &mut results)).await;

        match outcome {
            Ok(Ok(())) => Ok(results),
            Ok(Err(e)) => Err(e.with_completed(results)),
            Err(_) => {
                warn!(
                    completed = results.len(),
                    timeout_secs = timeout.as_secs(),
                    "hop chain execution timed out"
                );
                Err(ChainError::new(format!(
                    "execution timed out after {}s",
                    timeout.as_secs()
                ))
                .with_completed(results))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use anyhow::anyhow;

    use super::*;

    #[derive(Default)]
    struct Journal {
        events: Mutex<Vec<String>>,
        dials: AtomicUsize,
    }

    impl Journal {
        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    struct FakeSession {
        host: String,
        journal: Arc<Journal>,
        unreachable: Vec<String>,
        exec_delay: Duration,
    }

    #[async_trait]
    impl HopSession for FakeSession {
        async fn tunnel(&self, next: &HopDescriptor) -> anyhow::Result<Box<dyn HopSession>> {
            self.journal.push(format!("tunnel {}->{}", self.host, next.host));
            if self.unreachable.contains(&next.host) {
                return Err(anyhow!("connection refused"));
            }
            Ok(Box::new(FakeSession {
                host: next.host.clone(),
                journal: self.journal.clone(),
                unreachable: self.unreachable.clone(),
                exec_delay: self.exec_delay,
            }))
        }

        async fn exec(&self, command: &str) -> anyhow::Result<RawOutput> {
            tokio::time::sleep(self.exec_delay).await;
            self.journal.push(format!("exec {} {command}", self.host));
            if command == "explode" {
                return Err(anyhow!("channel closed"));
            }
            Ok(RawOutput {
                stdout: format!("{command} on {}", self.host),
                stderr: String::new(),
                exit_status: i32::from(command == "false"),
            })
        }

        async fn close(&self) {
            self.journal.push(format!("close {}", self.host));
        }
    }

    struct FakeDialer {
        journal: Arc<Journal>,
        unreachable: Vec<String>,
        exec_delay: Duration,
    }

    impl FakeDialer {
        fn new(unreachable: &[&str]) -> Self {
            Self {
                journal: Arc::new(Journal::default()),
                unreachable: unreachable.iter().map(ToString::to_string).collect(),
                exec_delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl HopDialer for FakeDialer {
        async fn dial(&self, hop: &HopDescriptor) -> anyhow::Result<Box<dyn HopSession>> {
            self.journal.dials.fetch_add(1, Ordering::SeqCst);
            self.journal.push(format!("dial {}", hop.host));
            if self.unreachable.contains(&hop.host) {
                return Err(anyhow!("connection refused"));
            }
            Ok(Box::new(FakeSession {
                host: hop.host.clone(),
                journal: self.journal.clone(),
                unreachable: self.unreachable.clone(),
                exec_delay: self.exec_delay,
            }))
        }
    }

    fn hops(names: &[&str]) -> Vec<HopDescriptor> {
        names
            .iter()
            .map(|n| HopDescriptor::with_password(*n, "root", "pw"))
            .collect()
    }

    fn commands(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn test_runs_on_last_hop_and_closes_in_reverse() {
        let dialer = FakeDialer::new(&[]);
        let journal = dialer.journal.clone();
        let executor = ChainExecutor::new(dialer);

        let results = executor
            .execute(&hops(&["a", "b", "c"]), &commands(&["one", "false"]), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].stdout, "one on c");
        assert_eq!(results[1].exit_status, 1);
        assert!(results[1].error.is_none());
        assert_eq!(
            journal.events(),
            vec![
                "dial a", "tunnel a->b", "tunnel b->c", "exec c one", "exec c false", "close c",
                "close b", "close a",
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_chain_never_dials() {
        let dialer = FakeDialer::new(&[]);
        let journal = dialer.journal.clone();
        let executor = ChainExecutor::new(dialer);

        let err = executor
            .execute(&[], &commands(&["x"]), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(err.message().contains("empty"));
        assert_eq!(journal.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_names_hop_and_runs_nothing() {
        let dialer = FakeDialer::new(&["b"]);
        let journal = dialer.journal.clone();
        let executor = ChainExecutor::new(dialer);

        let err = executor
            .execute(&hops(&["a", "b", "c"]), &commands(&["one"]), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(err.message().starts_with("failed to connect to hop 2 of 3"));
        assert!(err.message().contains("connection refused"));
        assert!(err.completed().is_empty());
        assert!(!journal.events().iter().any(|e| e.starts_with("exec")));
        assert!(journal.events().contains(&"close a".to_string()));
    }

    #[tokio::test]
    async fn test_exec_failure_aborts_and_keeps_partial_results() {
        let executor = ChainExecutor::new(FakeDialer::new(&[]));

        let err = executor
            .execute(&hops(&["a"]), &commands(&["one", "explode", "never"]), Duration::from_secs(5))
            .await
            .unwrap_err();

        let completed = err.into_completed();
        assert_eq!(completed.len(), 2);
        assert!(completed[0].success());
        assert_eq!(completed[1].error.as_deref(), Some("channel closed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_completed_results() {
        let mut dialer = FakeDialer::new(&[]);
        dialer.exec_delay = Duration::from_secs(4);
        let executor = ChainExecutor::new(dialer);

        let err = executor
            .execute(&hops(&["a"]), &commands(&["one", "two", "three"]), Duration::from_secs(10))
            .await
            .unwrap_err();

        assert_eq!(err.message(), "execution timed out after 10s");
        assert_eq!(err.completed().len(), 2);
    }
}
