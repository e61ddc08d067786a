//! Remote shell execution over SSH
//!
//! One authenticated session per target; every command opens its own
//! channel on that session, so concurrent commands share the transport.

use crate::{ExecError, Result};
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use serve_core::types::NO_EXIT_CODE;
use serve_core::{AuthConfig, Connection, ExecOptions, ExecutionResult, ExecutionTarget, HostIdentity};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Authentication material for a remote session
#[derive(Clone)]
pub enum Credential {
    Password(String),
    Key {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl From<&AuthConfig> for Credential {
    fn from(auth: &AuthConfig) -> Self {
        match auth {
            AuthConfig::Password { password } => Credential::Password(password.clone()),
            AuthConfig::Key { path, passphrase } => Credential::Key {
                path: path.clone(),
                passphrase: passphrase.clone(),
            },
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(***)"),
            Credential::Key { path, .. } => f.debug_struct("Key").field("path", path).finish(),
        }
    }
}

/// Client-side session handler
pub struct ClientHandler {
    host: String,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        // Host keys are accepted; the server registry is the trust boundary
        debug!(host = %self.host, "Accepting server host key");
        Ok(true)
    }
}

type Session = Arc<Handle<ClientHandler>>;

/// Execution target backed by an SSH session
pub struct RemoteShellTarget {
    identity: HostIdentity,
    credential: Credential,
    connect_timeout: Duration,
    session: RwLock<Option<Session>>,
    connect_lock: Mutex<()>,
}

impl RemoteShellTarget {
    pub fn new(identity: HostIdentity, credential: Credential, connect_timeout: Duration) -> Self {
        Self {
            identity,
            credential,
            connect_timeout,
            session: RwLock::new(None),
            connect_lock: Mutex::new(()),
        }
    }

    fn current_session(&self) -> Option<Session> {
        let guard = self.session.read().ok()?;
        guard.as_ref().filter(|handle| !handle.is_closed()).cloned()
    }

    fn store_session(&self, session: Option<Session>) -> Option<Session> {
        match self.session.write() {
            Ok(mut guard) => std::mem::replace(&mut *guard, session),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), session),
        }
    }

    async fn dial(&self) -> Result<Handle<ClientHandler>> {
        let config = Arc::new(client::Config::default());
        let handler = ClientHandler {
            host: self.identity.host.clone(),
        };

        let mut handle = client::connect(
            config,
            (self.identity.host.as_str(), self.identity.port),
            handler,
        )
        .await?;

        let authenticated = match &self.credential {
            Credential::Password(password) => {
                handle
                    .authenticate_password(self.identity.username.clone(), password.clone())
                    .await?
            }
            Credential::Key { path, passphrase } => {
                let key_pair = russh_keys::load_secret_key(path, passphrase.as_deref())?;
                handle
                    .authenticate_publickey(self.identity.username.clone(), Arc::new(key_pair))
                    .await?
            }
        };

        if !authenticated {
            return Err(ExecError::AuthenticationFailed(format!(
                "authentication failed for {}",
                self.identity
            )));
        }

        Ok(handle)
    }

    async fn run_channel(session: &Session, command: &str, options: &ExecOptions) -> ExecutionResult {
        let mut channel = match session.channel_open_session().await {
            Ok(channel) => channel,
            Err(e) => return ExecutionResult::failure(format!("Failed to open channel: {}", e)),
        };

        if let Err(e) = channel.exec(true, command).await {
            return ExecutionResult::failure(format!("Failed to exec command: {}", e));
        }

        let cap = options.max_output_bytes.unwrap_or(usize::MAX);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => append_capped(&mut stdout, data, cap),
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    append_capped(&mut stderr, data, cap)
                }
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status as i32),
                _ => {}
            }
        }

        let stdout = options.limit_output(String::from_utf8_lossy(&stdout).into_owned());
        let stderr = options.limit_output(String::from_utf8_lossy(&stderr).into_owned());
        match exit_code {
            Some(code) => ExecutionResult::from_exit(code, stdout, stderr),
            None => {
                let mut result = ExecutionResult::from_exit(NO_EXIT_CODE, stdout, stderr);
                result.error = Some("Channel closed without exit status".to_string());
                result
            }
        }
    }
}

fn append_capped(buffer: &mut Vec<u8>, data: &[u8], cap: usize) {
    // Keep one byte past the cap so truncation is still detected downstream
    let room = cap.saturating_add(1).saturating_sub(buffer.len());
    buffer.extend_from_slice(&data[..data.len().min(room)]);
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Prefix `command` with the requested environment and working directory
pub fn compose_command(command: &str, options: &ExecOptions) -> String {
    let mut composed = String::new();
    for (key, value) in &options.env {
        composed.push_str(&format!("export {}={}; ", key, shell_quote(value)));
    }
    if let Some(dir) = &options.working_dir {
        composed.push_str(&format!("cd {} && ", shell_quote(dir)));
    }
    composed.push_str(command);
    composed
}

#[async_trait]
impl ExecutionTarget for RemoteShellTarget {
    fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    async fn execute(&self, command: &str, options: &ExecOptions) -> ExecutionResult {
        let Some(session) = self.current_session() else {
            return ExecutionResult::not_connected(&self.identity);
        };

        let started = Instant::now();
        let full_command = compose_command(command, options);
        debug!(host = %self.identity, command, "Executing remote command");

        let result = match options.timeout_ms {
            Some(timeout_ms) => {
                match timeout(
                    Duration::from_millis(timeout_ms),
                    Self::run_channel(&session, &full_command, options),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => return ExecutionResult::timed_out(timeout_ms),
                }
            }
            None => Self::run_channel(&session, &full_command, options).await,
        };

        result.with_duration_ms(started.elapsed().as_millis() as u64)
    }
}

#[async_trait]
impl Connection for RemoteShellTarget {
    async fn connect(&self) -> serve_core::Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        info!(host = %self.identity, "Opening SSH session");
        let handle = match timeout(self.connect_timeout, self.dial()).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                warn!(host = %self.identity, "Failed to connect: {}", e);
                return Err(e.into());
            }
            Err(_) => {
                return Err(serve_core::Error::timeout(format!(
                    "Connection to {} timed out after {}ms",
                    self.identity,
                    self.connect_timeout.as_millis()
                )));
            }
        };

        self.store_session(Some(Arc::new(handle)));
        info!(host = %self.identity, "SSH session established");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.current_session().is_some()
    }

    async fn disconnect(&self) -> serve_core::Result<()> {
        let Some(session) = self.store_session(None) else {
            return Ok(());
        };

        if session.is_closed() {
            return Ok(());
        }

        info!(host = %self.identity, "Closing SSH session");
        session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| serve_core::Error::connection(format!("Failed to disconnect {}: {}", self.identity, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serve_core::ErrorKind;

    fn unreachable_target() -> RemoteShellTarget {
        RemoteShellTarget::new(
            HostIdentity::remote("127.0.0.1", 1, "nobody"),
            Credential::Password("secret".to_string()),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_execute_without_session_is_not_connected() {
        let target = unreachable_target();
        assert!(!target.is_connected());

        let result = target.run("uptime").await;
        assert!(!result.success);
        assert_eq!(result.exit_code, NO_EXIT_CODE);
        assert!(result.error_text().contains("Not connected"));
    }

    #[tokio::test]
    async fn test_connect_refused_is_classified() {
        let target = unreachable_target();
        let err = target.connect().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
        assert!(err.is_retryable());
        assert!(!target.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_noop() {
        let target = unreachable_target();
        assert!(target.disconnect().await.is_ok());
    }

    #[test]
    fn test_compose_command() {
        let options = ExecOptions::new()
            .with_env("CUDA_VISIBLE_DEVICES", "0,1")
            .with_working_dir("/srv/it's here");

        let composed = compose_command("python serve.py", &options);
        assert_eq!(
            composed,
            "export CUDA_VISIBLE_DEVICES='0,1'; cd '/srv/it'\\''s here' && python serve.py"
        );
        assert_eq!(compose_command("ls", &ExecOptions::default()), "ls");
    }

    #[test]
    fn test_append_capped() {
        let mut buffer = Vec::new();
        append_capped(&mut buffer, b"abcdef", 3);
        append_capped(&mut buffer, b"ghi", 3);
        assert_eq!(buffer, b"abcd");
    }

    #[test]
    fn test_credential_debug_hides_password() {
        let credential = Credential::from(&AuthConfig::Password {
            password: "hunter2".to_string(),
        });
        assert!(!format!("{:?}", credential).contains("hunter2"));
    }
}
