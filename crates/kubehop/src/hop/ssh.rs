//! `russh` transport for hop chains.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use russh::client::{self, AuthResult, Config, Handle};
use russh::keys::ssh_key::HashAlg;
use russh::keys::PrivateKeyWithHashAlg;
use russh::{ChannelMsg, Disconnect};
use tokio::sync::Mutex;
use tracing::debug;

use super::chain::{HopDialer, HopSession, RawOutput};
use super::{Credential, HopDescriptor};
use crate::config::Settings;

/// Accepts every server key and logs its fingerprint.
struct ClientHandler {
    endpoint: String,
}

impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            endpoint = %self.endpoint,
            fingerprint = %server_public_key.fingerprint(HashAlg::Sha256),
            "accepting server host key"
        );
        Ok(true)
    }
}

/// Production [`HopDialer`] backed by `russh`.
pub struct RusshDialer {
    config: Arc<Config>,
}

impl RusshDialer {
    #[must_use]
    pub fn new(settings: &Settings) -> Self {
        Self::with_timeouts(settings.keepalive(), settings.inactivity())
    }

    #[must_use]
    pub fn with_timeouts(keepalive: Duration, inactivity: Duration) -> Self {
        let config = Config {
            keepalive_interval: Some(keepalive),
            inactivity_timeout: Some(inactivity),
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl HopDialer for RusshDialer {
    async fn dial(&self, hop: &HopDescriptor) -> Result<Box<dyn HopSession>> {
        let handler = ClientHandler {
            endpoint: hop.to_string(),
        };
        let mut handle = client::connect(self.config.clone(), (hop.host.as_str(), hop.port), handler)
            .await
            .with_context(|| format!("failed to connect to {}:{}", hop.host, hop.port))?;

        authenticate(&mut handle, hop).await?;
        Ok(Box::new(RusshSession::new(handle, self.config.clone(), hop)))
    }
}

async fn authenticate(handle: &mut Handle<ClientHandler>, hop: &HopDescriptor) -> Result<()> {
    let result = match &hop.credential {
        Credential::Password { password } => handle
            .authenticate_password(hop.username.clone(), password.clone())
            .await
            .context("password authentication request")?,
        Credential::PrivateKey {
            private_key,
            passphrase,
        } => {
            let key = russh::keys::decode_secret_key(private_key, passphrase.as_deref())
                .context("failed to decode private key")?;
            authenticate_key(handle, &hop.username, key).await?
        }
        Credential::KeyFile {
            key_path,
            passphrase,
        } => {
            let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                .with_context(|| format!("failed to load private key {}", key_path.display()))?;
            authenticate_key(handle, &hop.username, key).await?
        }
    };

    match result {
        AuthResult::Success => {
            debug!(endpoint = %hop, method = hop.credential.method(), "authenticated");
            Ok(())
        }
        AuthResult::Failure { .. } => bail!(
            "authentication failed for {hop} using {}",
            hop.credential.method()
        ),
    }
}

async fn authenticate_key(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    key: russh::keys::ssh_key::PrivateKey,
) -> Result<AuthResult> {
    let hash = handle.best_supported_rsa_hash().await?.flatten();
    let key = PrivateKeyWithHashAlg::new(Arc::new(key), hash);
    handle
        .authenticate_publickey(username.to_string(), key)
        .await
        .context("public key authentication request")
}

struct RusshSession {
    handle: Mutex<Handle<ClientHandler>>,
    config: Arc<Config>,
    endpoint: String,
}

impl RusshSession {
    fn new(handle: Handle<ClientHandler>, config: Arc<Config>, hop: &HopDescriptor) -> Self {
        Self {
            handle: Mutex::new(handle),
            config,
            endpoint: hop.to_string(),
        }
    }
}

#[async_trait]
impl HopSession for RusshSession {
    async fn tunnel(&self, next: &HopDescriptor) -> Result<Box<dyn HopSession>> {
        let channel = {
            let handle = self.handle.lock().await;
            handle
                .channel_open_direct_tcpip(next.host.clone(), u32::from(next.port), "127.0.0.1", 0)
                .await
                .with_context(|| {
                    format!(
                        "failed to connect to {}:{} through {}",
                        next.host, next.port, self.endpoint
                    )
                })?
        };

        let handler = ClientHandler {
            endpoint: next.to_string(),
        };
        let mut handle = client::connect_stream(self.config.clone(), channel.into_stream(), handler)
            .await
            .with_context(|| format!("SSH handshake with {next} failed"))?;

        authenticate(&mut handle, next).await?;
        Ok(Box::new(RusshSession::new(handle, self.config.clone(), next)))
    }

    async fn exec(&self, command: &str) -> Result<RawOutput> {
        let handle = self.handle.lock().await;
        let mut channel = handle
            .channel_open_session()
            .await
            .context("open session channel")?;
        channel.exec(true, command).await.context("exec request")?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status: code } => {
                    exit_status = Some(i32::try_from(code).unwrap_or(i32::MAX));
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }
        let _ = channel.close().await;

        Ok(RawOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status: exit_status.unwrap_or(-1),
        })
    }

    async fn close(&self) {
        let handle = self.handle.lock().await;
        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(endpoint = %self.endpoint, error = %e, "disconnect failed");
        }
    }
}
