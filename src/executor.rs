//! Remote script execution on guests.
//!
//! Scripts are piped to `bash -s` over SSH as the control user, which
//! switches to the script's run-as user with `sudo`. Output is forwarded
//! line by line as it arrives.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::client;
use russh::keys::{self, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect};

use crate::error::MulchError;
use crate::util::shell_quote;

const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `payload` on `host` as `run_as` and return the exit status.
    /// Transport failures and timeouts are errors; a non-zero exit is not.
    async fn run(
        &self,
        host: &str,
        run_as: &str,
        payload: &[u8],
        on_output: &(dyn for<'o> Fn(&'o str) + Send + Sync),
    ) -> Result<i32, MulchError>;
}

/// Prefix `script` with `export` lines for `env`.
pub fn build_script_payload<'a>(
    env: impl IntoIterator<Item = (&'a str, &'a str)>,
    script: &[u8],
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(script.len() + 256);
    for (key, value) in env {
        payload.extend_from_slice(format!("export {key}={}\n", shell_quote(value)).as_bytes());
    }
    payload.extend_from_slice(script);
    if !script.ends_with(b"\n") {
        payload.push(b'\n');
    }
    payload
}

/// Accepts every host key: guests are fresh on each revision.
struct SshHandler;

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub struct SshExecutor {
    user: String,
    key_path: PathBuf,
    connect_timeout: Duration,
    script_timeout: Option<Duration>,
}

impl SshExecutor {
    pub fn new(
        user: impl Into<String>,
        key_path: impl Into<PathBuf>,
        connect_timeout: Duration,
        script_timeout: Option<Duration>,
    ) -> Self {
        Self {
            user: user.into(),
            key_path: key_path.into(),
            connect_timeout,
            script_timeout,
        }
    }

    fn remote_err(host: &str, message: impl Into<String>) -> MulchError {
        MulchError::Remote {
            host: host.to_string(),
            message: message.into(),
        }
    }

    /// Connect and authenticate, retrying while sshd comes up.
    async fn connect(&self, host: &str) -> Result<client::Handle<SshHandler>, MulchError> {
        let key_data = tokio::fs::read_to_string(&self.key_path)
            .await
            .map_err(|e| MulchError::Io {
                context: format!("reading SSH key {}", self.key_path.display()),
                source: e,
            })?;
        let key = keys::decode_secret_key(&key_data, None)
            .map_err(|e| Self::remote_err(host, format!("decoding SSH key: {e}")))?;
        let key = Arc::new(key);

        let addr = format!("{host}:22");
        let deadline = Instant::now() + self.connect_timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let config = Arc::new(client::Config::default());
            match client::connect(config, &*addr, SshHandler).await {
                Ok(mut handle) => {
                    let auth = handle
                        .authenticate_publickey(
                            &self.user,
                            PrivateKeyWithHashAlg::new(Arc::clone(&key), None),
                        )
                        .await
                        .map_err(|e| Self::remote_err(host, format!("SSH auth failed: {e}")))?;
                    if !auth.success() {
                        return Err(Self::remote_err(
                            host,
                            format!("SSH auth rejected for user {}", self.user),
                        ));
                    }
                    tracing::debug!(addr, attempts, "SSH session established");
                    return Ok(handle);
                }
                Err(e) if Instant::now() < deadline => {
                    tracing::debug!(addr, attempts, "SSH not ready yet: {e}");
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(Self::remote_err(
                        host,
                        format!(
                            "SSH connect failed after {attempts} attempts over {}s: {e}",
                            self.connect_timeout.as_secs()
                        ),
                    ));
                }
            }
        }
    }

    async fn exec(
        &self,
        handle: &client::Handle<SshHandler>,
        host: &str,
        run_as: &str,
        payload: &[u8],
        on_output: &(dyn for<'o> Fn(&'o str) + Send + Sync),
    ) -> Result<i32, MulchError> {
        let ssh = |e: russh::Error| Self::remote_err(host, e.to_string());

        let mut channel = handle.channel_open_session().await.map_err(ssh)?;
        let command = format!("sudo -iu {} bash -s", shell_quote(run_as));
        channel.exec(true, command).await.map_err(ssh)?;
        channel.data(payload).await.map_err(ssh)?;
        channel.eof().await.map_err(ssh)?;

        let mut lines = LineBuffer::default();
        let mut status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } | ChannelMsg::ExtendedData { ref data, .. } => {
                    lines.push(data, on_output);
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    status = Some(exit_status as i32);
                }
                _ => {}
            }
        }
        lines.flush(on_output);

        status.ok_or_else(|| Self::remote_err(host, "channel closed without exit status"))
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(
        &self,
        host: &str,
        run_as: &str,
        payload: &[u8],
        on_output: &(dyn for<'o> Fn(&'o str) + Send + Sync),
    ) -> Result<i32, MulchError> {
        let handle = self.connect(host).await?;

        let run = self.exec(&handle, host, run_as, payload, on_output);
        let result = match self.script_timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => Err(Self::remote_err(
                    host,
                    format!("script timed out after {}s", limit.as_secs()),
                )),
            },
            None => run.await,
        };

        let _ = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
        result
    }
}

/// Splits a byte stream into lines, tolerating chunks that end mid-line.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, data: &[u8], on_line: &(dyn for<'o> Fn(&'o str) + Send + Sync)) {
        self.pending.extend_from_slice(data);
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            on_line(text.trim_end_matches('\r'));
        }
    }

    fn flush(&mut self, on_line: &(dyn for<'o> Fn(&'o str) + Send + Sync)) {
        if !self.pending.is_empty() {
            on_line(&String::from_utf8_lossy(&self.pending));
            self.pending.clear();
        }
    }
}
