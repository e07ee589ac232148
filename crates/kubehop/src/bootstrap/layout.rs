//! File locations used by detached installs on the remote host.

/// Paths under the remote working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLayout {
    dir: String,
}

impl RemoteLayout {
    #[must_use]
    pub fn new(dir: &str) -> Self {
        let trimmed = dir.trim_end_matches('/');
        Self {
            dir: if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() },
        }
    }

    #[must_use]
    pub fn dir(&self) -> &str {
        &self.dir
    }

    fn path(&self, name: &str) -> String {
        if self.dir == "/" {
            format!("/{name}")
        } else {
            format!("{}/{name}", self.dir)
        }
    }

    #[must_use]
    pub fn install_script(&self) -> String {
        self.path("install.sh")
    }

    #[must_use]
    pub fn install_log(&self) -> String {
        self.path("install.log")
    }

    #[must_use]
    pub fn install_pid(&self) -> String {
        self.path("install.pid")
    }

    #[must_use]
    pub fn install_failed(&self) -> String {
        self.path("install.failed")
    }

    #[must_use]
    pub fn watcher_script(&self) -> String {
        self.path("watcher.sh")
    }

    #[must_use]
    pub fn watcher_log(&self) -> String {
        self.path("watcher.log")
    }

    #[must_use]
    pub fn watcher_pid(&self) -> String {
        self.path("watcher.pid")
    }

    #[must_use]
    pub fn watcher_status(&self) -> String {
        self.path("watcher.status")
    }

    #[must_use]
    pub fn join_command(&self) -> String {
        self.path("join-command")
    }

    #[must_use]
    pub fn certificate_key(&self) -> String {
        self.path("certificate-key")
    }

    #[must_use]
    pub fn extract_debug_log(&self) -> String {
        self.path("extract-debug.log")
    }
}

impl Default for RemoteLayout {
    fn default() -> Self {
        Self::new("/tmp/kubehop")
    }
}
