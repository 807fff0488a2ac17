use crate::config::{AuthMethod, ConnectOptions, Target};
use crate::context::CallContext;
use crate::error::SshError;
use crate::session::{ChannelEvent, Connector, RemoteChannel, RemoteSession, Session, Signal};
use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{Config as ClientConfig, Handle};
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{decode_secret_key, Algorithm, PrivateKey};
use russh::{client, Channel, ChannelMsg, Disconnect, Sig};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type DynAgent = AgentClient<Box<dyn AgentStream + Send + Unpin>>;

/// Dials real SSH connections with `russh`.
#[derive(Clone, Debug, Default)]
pub struct SshClient {
    options: ConnectOptions,
}

pub struct SshSession {
    key: String,
    inner: Mutex<Handle<ClientHandler>>,
}

pub struct SshChannel {
    channel: Channel<client::Msg>,
}

enum PreparedAuth {
    Key(PrivateKey),
    Agent(DynAgent),
}

impl SshClient {
    pub fn new(options: ConnectOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Connector for SshClient {
    async fn connect(&self, ctx: &CallContext, target: &Target) -> Result<Session, SshError> {
        let addr = target.addr();
        debug!(method = ?target.auth_method, "preparing auth");
        let auth = prepare_auth(target).await?;

        info!(addr = %addr, "TCP dialing");
        let dial_timeout = self.options.dial_timeout;
        let stream = ctx
            .run(async {
                match tokio::time::timeout(
                    dial_timeout,
                    TcpStream::connect((target.host.as_str(), target.port)),
                )
                .await
                {
                    Ok(Ok(stream)) => Ok(stream),
                    Ok(Err(err)) => Err(SshError::Dial {
                        addr: addr.clone(),
                        message: err.to_string(),
                    }),
                    Err(_) => Err(SshError::Dial {
                        addr: addr.clone(),
                        message: "timed out".to_string(),
                    }),
                }
            })
            .await?;
        debug!(addr = %addr, "TCP connected, starting handshake");

        // If the context ends mid-handshake the future is dropped together with
        // the socket it owns, which aborts the handshake.
        let config = Arc::new(build_client_config(&self.options));
        let handler = ClientHandler {
            host: target.host.clone(),
            port: target.port,
        };
        let handle = ctx
            .run(async {
                let mut handle = client::connect_stream(config, stream, handler)
                    .await
                    .map_err(|e| SshError::Handshake {
                        addr: addr.clone(),
                        message: e.to_string(),
                    })?;
                authenticate(&mut handle, target, auth).await?;
                Ok(handle)
            })
            .await?;

        // A cancellation racing the end of the handshake still fails the call.
        if let Some(err) = ctx.err() {
            warn!(addr = %addr, error = %err, "context ended after handshake");
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
            return Err(err);
        }

        info!(addr = %addr, "SSH session established");
        Ok(Arc::new(SshSession {
            key: target.key(),
            inner: Mutex::new(handle),
        }))
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn keepalive(&self) -> Result<(), SshError> {
        let handle = self.inner.lock().await;
        if handle.is_closed() {
            return Err(SshError::channel("connection closed"));
        }
        handle.send_keepalive(true).await.map_err(SshError::channel)
    }

    async fn exec(&self, command: &str) -> Result<Box<dyn RemoteChannel>, SshError> {
        let channel = {
            let handle = self.inner.lock().await;
            handle
                .channel_open_session()
                .await
                .map_err(|e| SshError::Channel(format!("creating session: {e}")))?
        };
        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::Channel(format!("starting {command:?}: {e}")))?;
        Ok(Box::new(SshChannel { channel }))
    }

    async fn close(&self) {
        let handle = self.inner.lock().await;
        if let Err(err) = handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!(key = %self.key, error = %err, "disconnect failed");
        }
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn write_stdin(&mut self, data: &[u8]) -> Result<(), SshError> {
        self.channel.data(data).await.map_err(SshError::channel)
    }

    async fn close_stdin(&mut self) -> Result<(), SshError> {
        self.channel.eof().await.map_err(SshError::channel)
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            match self.channel.wait().await? {
                ChannelMsg::Data { data } => {
                    return Some(ChannelEvent::Stdout(Bytes::copy_from_slice(&data)))
                }
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    return Some(ChannelEvent::Stderr(Bytes::copy_from_slice(&data)))
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    return Some(ChannelEvent::Exit(exit_status))
                }
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    return Some(ChannelEvent::Signaled(format!("{signal_name:?}")))
                }
                ChannelMsg::Close => return None,
                _ => {}
            }
        }
    }

    async fn signal(&mut self, signal: Signal) -> Result<(), SshError> {
        let sig = match signal {
            Signal::Term => Sig::TERM,
            Signal::Int => Sig::INT,
            Signal::Kill => Sig::KILL,
        };
        self.channel.signal(sig).await.map_err(SshError::channel)
    }

    async fn close(&mut self) -> Result<(), SshError> {
        self.channel.close().await.map_err(SshError::channel)
    }
}

#[derive(Clone)]
pub(crate) struct ClientHandler {
    host: String,
    port: u16,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        let host = self.host.clone();
        let port = self.port;
        let algorithm = server_public_key.algorithm();
        async move {
            warn!(host = %host, port, algorithm = %algorithm, "accepting host key without verification");
            Ok(true)
        }
    }
}

fn build_client_config(options: &ConnectOptions) -> ClientConfig {
    ClientConfig {
        keepalive_interval: options.keepalive_interval,
        keepalive_max: 3,
        inactivity_timeout: options.inactivity_timeout,
        ..Default::default()
    }
}

/// Resolves credentials before any network traffic so configuration mistakes
/// surface without a dial.
async fn prepare_auth(target: &Target) -> Result<PreparedAuth, SshError> {
    let auth_err = |message: String| SshError::AuthConfig {
        host: target.host.clone(),
        message,
    };
    match &target.auth_method {
        AuthMethod::Key { private_key_path } => {
            let data = tokio::fs::read_to_string(private_key_path)
                .await
                .map_err(|e| auth_err(format!("reading key {}: {e}", private_key_path.display())))?;
            let key = decode_secret_key(&data, None)
                .map_err(|e| auth_err(format!("parsing key {}: {e}", private_key_path.display())))?;
            Ok(PreparedAuth::Key(key))
        }
        AuthMethod::Agent => {
            #[cfg(unix)]
            let client = {
                if std::env::var_os("SSH_AUTH_SOCK").is_none() {
                    return Err(auth_err("SSH_AUTH_SOCK not set".to_string()));
                }
                AgentClient::connect_env()
                    .await
                    .map_err(|e| auth_err(format!("connecting to SSH agent: {e}")))?
            };

            #[cfg(windows)]
            let client = {
                use tokio::net::windows::named_pipe::ClientOptions;
                let sock = std::env::var("SSH_AUTH_SOCK")
                    .unwrap_or_else(|_| "\\\\.\\pipe\\openssh-ssh-agent".to_string());
                let stream = ClientOptions::new()
                    .open(sock)
                    .map_err(|e| auth_err(format!("connecting to SSH agent: {e}")))?;
                AgentClient::connect(stream)
            };

            Ok(PreparedAuth::Agent(client.dynamic()))
        }
        AuthMethod::Password => Err(auth_err(
            "password auth requires interactive input; use key or agent instead".to_string(),
        )),
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    target: &Target,
    auth: PreparedAuth,
) -> Result<(), SshError> {
    let user = target.username.clone();
    let handshake_err = |e: russh::Error| SshError::Handshake {
        addr: target.addr(),
        message: e.to_string(),
    };
    let rejected = || SshError::AuthRejected {
        user: target.username.clone(),
        host: target.host.clone(),
    };
    match auth {
        PreparedAuth::Key(key) => {
            let hash = if matches!(key.algorithm(), Algorithm::Rsa { .. }) {
                handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(handshake_err)?
                    .flatten()
            } else {
                None
            };
            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), hash);
            let res = handle
                .authenticate_publickey(user, key_with_hash)
                .await
                .map_err(handshake_err)?;
            if matches!(res, client::AuthResult::Success) {
                Ok(())
            } else {
                Err(rejected())
            }
        }
        PreparedAuth::Agent(mut agent) => {
            let keys = agent.request_identities().await.map_err(|e| SshError::AuthConfig {
                host: target.host.clone(),
                message: format!("listing agent identities: {e}"),
            })?;
            for key in keys {
                let hash = if matches!(key.algorithm(), Algorithm::Rsa { .. }) {
                    handle
                        .best_supported_rsa_hash()
                        .await
                        .map_err(handshake_err)?
                        .flatten()
                } else {
                    None
                };
                let res = handle
                    .authenticate_publickey_with(user.clone(), key, hash, &mut agent)
                    .await
                    .map_err(|e| SshError::Handshake {
                        addr: target.addr(),
                        message: e.to_string(),
                    })?;
                if matches!(res, client::AuthResult::Success) {
                    return Ok(());
                }
            }
            Err(rejected())
        }
    }
}
