//! SSH implementation of the remote transport

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect, Sig};
use russh_keys::key::PublicKey;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::config::{AuthMethod, RemoteConfig};
use crate::remote::{shell_quote, ExecOutput, RemoteConnector, RemoteSession};
use crate::{PoolError, Result};

/// Opens authenticated SSH sessions
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    config: Arc<client::Config>,
}

impl SshConnector {
    pub fn new() -> Self {
        Self::default()
    }

    async fn authenticate(
        &self,
        environment: &str,
        config: &RemoteConfig,
        handle: &mut Handle<SshHandler>,
    ) -> Result<()> {
        let authenticated = match config.auth_method {
            AuthMethod::Key => {
                let path = config.private_key_path.as_ref().ok_or_else(|| {
                    PoolError::configuration_error(
                        format!("environments.{}.remote.private_key_path", environment),
                        "Key authentication requires a private key path",
                    )
                })?;

                let key = russh_keys::load_secret_key(path, config.passphrase.as_deref()).map_err(|e| {
                    PoolError::authentication_error(
                        environment,
                        format!("Failed to load private key {}: {}", path.display(), e),
                    )
                })?;

                handle
                    .authenticate_publickey(config.username.clone(), Arc::new(key))
                    .await
                    .map_err(|e| PoolError::transport_error(environment, format!("Authentication error: {}", e)))?
            }
            AuthMethod::Password => {
                let password = config.password.clone().unwrap_or_default();
                handle
                    .authenticate_password(config.username.clone(), password)
                    .await
                    .map_err(|e| PoolError::transport_error(environment, format!("Authentication error: {}", e)))?
            }
        };

        if !authenticated {
            return Err(PoolError::authentication_error(
                environment,
                format!("Credentials rejected for {}", config.endpoint()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn connect(&self, environment: &str, config: &RemoteConfig) -> Result<Arc<dyn RemoteSession>> {
        if config.jump_host.is_some() {
            return Err(PoolError::configuration_error(
                format!("environments.{}.remote.jump_host", environment),
                "Connecting through a jump host is not supported",
            ));
        }

        let key_rejected = Arc::new(AtomicBool::new(false));
        let handler = SshHandler {
            environment: environment.to_string(),
            expected_fingerprint: config.host_key_fingerprint.clone(),
            key_rejected: Arc::clone(&key_rejected),
        };

        debug!("Connecting to {} for environment '{}'", config.endpoint(), environment);
        let connect = client::connect(Arc::clone(&self.config), (config.host.as_str(), config.port), handler);
        let mut handle = tokio::time::timeout(config.connect_timeout(), connect)
            .await
            .map_err(|_| {
                PoolError::transport_error(
                    environment,
                    format!(
                        "Connection to {} timed out after {}s",
                        config.endpoint(),
                        config.connect_timeout_secs
                    ),
                )
            })?
            .map_err(|e| {
                if key_rejected.load(Ordering::SeqCst) {
                    PoolError::authentication_error(
                        environment,
                        format!("Host key of {} does not match the configured fingerprint", config.host),
                    )
                } else {
                    PoolError::transport_error(
                        environment,
                        format!("Failed to connect to {}: {}", config.endpoint(), e),
                    )
                }
            })?;

        self.authenticate(environment, config, &mut handle).await?;
        info!("SSH session established to {} for environment '{}'", config.endpoint(), environment);

        Ok(Arc::new(SshSession {
            environment: environment.to_string(),
            handle: Mutex::new(handle),
            interrupt: Notify::new(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct SshHandler {
    environment: String,
    expected_fingerprint: Option<String>,
    key_rejected: Arc<AtomicBool>,
}

#[async_trait]
impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        debug!("Server host key for environment '{}': {}", self.environment, fingerprint);

        match &self.expected_fingerprint {
            Some(expected) if *expected != fingerprint => {
                warn!(
                    "Host key mismatch for environment '{}': expected {}, got {}",
                    self.environment, expected, fingerprint
                );
                self.key_rejected.store(true, Ordering::SeqCst);
                Ok(false)
            }
            _ => Ok(true),
        }
    }
}

enum Wake {
    Message(Option<ChannelMsg>),
    Interrupt,
}

/// One authenticated SSH connection
pub struct SshSession {
    environment: String,
    handle: Mutex<Handle<SshHandler>>,
    interrupt: Notify,
    closed: AtomicBool,
}

impl SshSession {
    async fn open_channel(&self) -> Result<Channel<Msg>> {
        let handle = self.handle.lock().await;
        handle.channel_open_session().await.map_err(|e| {
            PoolError::transport_error(&self.environment, format!("Failed to open channel: {}", e))
        })
    }

    /// Run `command`, optionally feeding `stdin`, until the channel closes
    async fn run(&self, command: &str, stdin: Option<&[u8]>) -> Result<(Option<u32>, Vec<u8>, Vec<u8>)> {
        if self.is_closed() {
            return Err(PoolError::transport_error(&self.environment, "Session is closed"));
        }

        let mut channel = self.open_channel().await?;
        channel.exec(true, command).await.map_err(|e| {
            PoolError::transport_error(&self.environment, format!("Failed to start command: {}", e))
        })?;

        if let Some(data) = stdin {
            channel.data(data).await.map_err(|e| {
                PoolError::transport_error(&self.environment, format!("Failed to send data: {}", e))
            })?;
            channel.eof().await.map_err(|e| {
                PoolError::transport_error(&self.environment, format!("Failed to send EOF: {}", e))
            })?;
        }

        let mut exit_code = None;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        loop {
            let wake = tokio::select! {
                msg = channel.wait() => Wake::Message(msg),
                _ = self.interrupt.notified() => Wake::Interrupt,
            };

            match wake {
                Wake::Message(Some(ChannelMsg::Data { ref data })) => stdout.extend_from_slice(data),
                Wake::Message(Some(ChannelMsg::ExtendedData { ref data, ext })) => {
                    if ext == 1 {
                        stderr.extend_from_slice(data);
                    }
                }
                Wake::Message(Some(ChannelMsg::ExitStatus { exit_status })) => exit_code = Some(exit_status),
                Wake::Message(Some(_)) => {}
                Wake::Message(None) => break,
                Wake::Interrupt => {
                    debug!("Sending TERM to '{}' on environment '{}'", command, self.environment);
                    if let Err(e) = channel.signal(Sig::TERM).await {
                        warn!("Failed to signal command on environment '{}': {}", self.environment, e);
                    }
                }
            }
        }

        Ok((exit_code, stdout, stderr))
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let (exit_code, stdout, stderr) = self.run(command, None).await?;
        Ok(ExecOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn upload(&self, contents: &[u8], remote_path: &str) -> Result<u64> {
        let command = format!("cat > {}", shell_quote(remote_path));
        let (exit_code, _, stderr) = self.run(&command, Some(contents)).await?;

        if exit_code != Some(0) {
            return Err(PoolError::remote_error(
                command,
                exit_code,
                String::from_utf8_lossy(&stderr).into_owned(),
            ));
        }
        Ok(contents.len() as u64)
    }

    async fn download(&self, remote_path: &str) -> Result<Vec<u8>> {
        let command = format!("cat {}", shell_quote(remote_path));
        let (exit_code, stdout, stderr) = self.run(&command, None).await?;

        if exit_code != Some(0) {
            return Err(PoolError::remote_error(
                command,
                exit_code,
                String::from_utf8_lossy(&stderr).into_owned(),
            ));
        }
        Ok(stdout)
    }

    fn interrupt(&self) {
        self.interrupt.notify_waiters();
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.interrupt.notify_waiters();

        let handle = self.handle.lock().await;
        if let Err(e) = handle.disconnect(Disconnect::ByApplication, "closing", "en").await {
            debug!("Disconnect from environment '{}' failed: {}", self.environment, e);
        }
    }

    fn is_closed(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return true;
        }
        match self.handle.try_lock() {
            Ok(handle) => handle.is_closed(),
            Err(_) => false,
        }
    }
}
