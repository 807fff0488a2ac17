use crate::error::CoreError;
use crate::events::{Pane, Update, UpdateDispatcher};
use async_trait::async_trait;
use bytes::Bytes;
use logmon_config::{AppConfig, AuthKind, LogFolder, ServerConfig};
use logmon_ssh::{
    download_file, format_size, list_files, read_file_content, start_tail, AuthMethod,
    CallContext, CommandOpts, ConnectionPool, FileEntry, Session, SshError, TailSink, Tailer,
    Target,
};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

#[derive(Clone, Debug)]
pub struct CoordinatorOptions {
    pub tail_lines: u32,
    pub connect_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl CoordinatorOptions {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            tail_lines: u32::try_from(cfg.defaults.tail_lines).unwrap_or(u32::MAX),
            connect_timeout: cfg.timeouts.connect(),
            shutdown_timeout: cfg.timeouts.shutdown(),
        }
    }
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            tail_lines: 100,
            connect_timeout: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

/// The user's current position: server, then folder, then file.
///
/// `epoch` changes whenever the position changes; background work started for
/// an older epoch is discarded.
#[derive(Clone, Debug, Default)]
pub struct Selection {
    pub server: Option<usize>,
    pub folder: Option<LogFolder>,
    pub file: Option<String>,
    pub epoch: u64,
}

/// Work waiting for a sudo password, or the kind of work a job does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Pending {
    Listing { epoch: u64 },
    Refresh { epoch: u64 },
    OpenFile { epoch: u64 },
}

impl Pending {
    fn epoch(self) -> u64 {
        match self {
            Pending::Listing { epoch }
            | Pending::Refresh { epoch }
            | Pending::OpenFile { epoch } => epoch,
        }
    }
}

/// File named on the command line, opened once its folder has been listed.
#[derive(Clone, Debug)]
struct AutoOpen {
    server: usize,
    folder: Option<String>,
    file: String,
}

#[derive(Default)]
struct State {
    selection: Selection,
    tail: Option<Tailer>,
    connect: Option<(u64, CallContext)>,
    refresh: Option<(u64, CallContext)>,
    next_attempt: u64,
    pending: Option<Pending>,
    auto_open: Option<AutoOpen>,
    stopped: bool,
}

impl State {
    fn is_current(&self, epoch: u64) -> bool {
        !self.stopped && self.selection.epoch == epoch
    }

    fn advance(&mut self) -> u64 {
        self.selection.epoch += 1;
        self.pending = None;
        self.selection.epoch
    }

    fn stop_tail(&mut self) {
        if let Some(tail) = self.tail.take() {
            debug!(path = tail.path(), "stopping tail");
            tail.request_stop();
        }
    }

    fn cancel_refresh(&mut self) {
        if let Some((_, ctx)) = self.refresh.take() {
            ctx.cancel();
        }
    }

    fn cancel_connect(&mut self) {
        if let Some((_, ctx)) = self.connect.take() {
            ctx.cancel();
        }
        self.cancel_refresh();
    }

    /// Starts a bounded attempt. A refresh only replaces an earlier refresh;
    /// anything else replaces every in-flight attempt.
    fn begin_attempt(
        &mut self,
        kind: Pending,
        root: &CallContext,
        timeout: Duration,
    ) -> (u64, CallContext) {
        self.next_attempt += 1;
        let ctx = root.child_with_timeout(timeout);
        let entry = Some((self.next_attempt, ctx.clone()));
        if matches!(kind, Pending::Refresh { .. }) {
            self.cancel_refresh();
            self.refresh = entry;
        } else {
            self.cancel_connect();
            self.connect = entry;
        }
        (self.next_attempt, ctx)
    }

    fn end_attempt(&mut self, attempt: u64) {
        if matches!(self.connect, Some((id, _)) if id == attempt) {
            self.connect = None;
        }
        if matches!(self.refresh, Some((id, _)) if id == attempt) {
            self.refresh = None;
        }
    }

    /// Drops the pending auto-open once the selection has left its server or folder.
    fn retain_auto_open(&mut self) {
        let keep = self.auto_open.as_ref().is_some_and(|auto| {
            self.selection.server == Some(auto.server)
                && match (&auto.folder, &self.selection.folder) {
                    (Some(wanted), Some(current)) => *wanted == current.path,
                    _ => true,
                }
        });
        if !keep {
            self.auto_open = None;
        }
    }
}

struct Inner {
    servers: Vec<ServerConfig>,
    options: CoordinatorOptions,
    pool: Arc<ConnectionPool>,
    updates: UpdateDispatcher,
    root: CallContext,
    state: Mutex<State>,
}

/// Turns user intents into background work and publishes the results.
///
/// Intent methods never block; they must be called from inside a tokio runtime.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Job {
    server: ServerConfig,
    target: Target,
    folder: LogFolder,
    kind: Pending,
    epoch: u64,
    attempt: u64,
    ctx: CallContext,
}

impl Coordinator {
    pub fn new(
        servers: Vec<ServerConfig>,
        pool: Arc<ConnectionPool>,
        updates: UpdateDispatcher,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                servers,
                options,
                pool,
                updates,
                root: CallContext::new(),
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn servers(&self) -> &[ServerConfig] {
        &self.inner.servers
    }

    pub fn selection(&self) -> Selection {
        self.inner.state.lock().selection.clone()
    }

    pub fn has_active_tail(&self) -> bool {
        self.inner.state.lock().tail.is_some()
    }

    fn server(&self, index: usize) -> Result<&ServerConfig, CoreError> {
        self.inner
            .servers
            .get(index)
            .ok_or_else(|| CoreError::NotFound(format!("server #{index}")))
    }

    pub fn select_server(&self, index: usize) -> Result<(), CoreError> {
        let server = self.server(index)?;
        let folders = server.effective_folders();
        let mut st = self.inner.state.lock();
        if st.stopped {
            return Ok(());
        }
        st.stop_tail();
        st.cancel_connect();
        st.advance();
        st.selection.server = Some(index);
        st.selection.folder = None;
        st.selection.file = None;
        st.retain_auto_open();
        info!(server = %server.name, "server selected");

        if server.has_multiple_folders() {
            self.inner.updates.submit(Update::Folders {
                server: server.name.clone(),
                folders,
            });
            return Ok(());
        }
        st.selection.folder = folders.into_iter().next();
        drop(st);
        self.connect()
    }

    pub fn select_folder(&self, index: usize) -> Result<(), CoreError> {
        let mut st = self.inner.state.lock();
        if st.stopped {
            return Ok(());
        }
        let server_index = st
            .selection
            .server
            .ok_or_else(|| CoreError::Invalid("no server selected".to_string()))?;
        let server = self.server(server_index)?;
        let folder = server
            .effective_folders()
            .into_iter()
            .nth(index)
            .ok_or_else(|| CoreError::NotFound(format!("folder #{index} on {}", server.name)))?;
        st.stop_tail();
        st.advance();
        st.selection.folder = Some(folder);
        st.selection.file = None;
        st.retain_auto_open();
        drop(st);
        self.connect()
    }

    pub fn up_directory(&self) {
        let mut st = self.inner.state.lock();
        if st.stopped {
            return;
        }
        st.stop_tail();
        st.cancel_connect();
        st.advance();
        st.selection.folder = None;
        st.selection.file = None;
        let server = st.selection.server.and_then(|i| self.inner.servers.get(i));
        match server {
            Some(server) if server.has_multiple_folders() => {
                self.inner.updates.submit(Update::Folders {
                    server: server.name.clone(),
                    folders: server.effective_folders(),
                });
            }
            _ => {
                st.selection.server = None;
                self.inner.updates.submit(Update::Focus(Pane::Servers));
            }
        }
        st.retain_auto_open();
    }

    /// Lists the current folder again without touching an active tail.
    pub fn refresh(&self) -> Result<(), CoreError> {
        let job = {
            let mut st = self.inner.state.lock();
            if st.stopped {
                return Ok(());
            }
            let epoch = st.selection.epoch;
            match self.prepare_job(&mut st, Pending::Refresh { epoch })? {
                Some(job) => job,
                None => return Ok(()),
            }
        };
        self.spawn_listing(job);
        Ok(())
    }

    fn connect(&self) -> Result<(), CoreError> {
        let job = {
            let mut st = self.inner.state.lock();
            let epoch = st.selection.epoch;
            match self.prepare_job(&mut st, Pending::Listing { epoch })? {
                Some(job) => job,
                None => return Ok(()),
            }
        };
        self.inner.updates.submit(Update::Connecting {
            server: job.server.name.clone(),
            folder: folder_label(&job.folder),
        });
        self.spawn_listing(job);
        Ok(())
    }

    /// Resolves the current server and folder and starts a bounded attempt.
    /// Returns `None` after publishing a sudo prompt when a password is needed first.
    fn prepare_job(&self, st: &mut State, kind: Pending) -> Result<Option<Job>, CoreError> {
        let server_index = st
            .selection
            .server
            .ok_or_else(|| CoreError::Invalid("no server selected".to_string()))?;
        let folder = st
            .selection
            .folder
            .clone()
            .ok_or_else(|| CoreError::Invalid("no folder selected".to_string()))?;
        let server = self.server(server_index)?.clone();
        let target = to_target(&server)?;

        if server.sudo && self.inner.pool.sudo_password(&target).is_none() {
            st.pending = Some(kind);
            self.inner.updates.submit(Update::SudoPrompt {
                server: server.name.clone(),
                retry: false,
            });
            return Ok(None);
        }

        let (attempt, ctx) =
            st.begin_attempt(kind, &self.inner.root, self.inner.options.connect_timeout);
        Ok(Some(Job {
            server,
            target,
            folder,
            kind,
            epoch: st.selection.epoch,
            attempt,
            ctx,
        }))
    }

    fn spawn_listing(&self, job: Job) {
        let this = self.clone();
        tokio::spawn(async move { this.run_listing(job).await });
    }

    async fn run_listing(&self, job: Job) {
        let opts = self.command_opts(&job.target);
        let result: Result<Vec<FileEntry>, CoreError> = async {
            let session = self.inner.pool.get_client(&job.ctx, &job.target).await?;
            let files = job
                .ctx
                .run(list_files(
                    session.as_ref(),
                    &job.folder.path,
                    &job.folder.file_patterns,
                    &opts,
                ))
                .await?;
            Ok(files)
        }
        .await;

        let auto_file = {
            let mut st = self.inner.state.lock();
            st.end_attempt(job.attempt);
            if !st.is_current(job.epoch) {
                debug!(server = %job.server.name, "discarding stale listing");
                return;
            }
            match result {
                Ok(files) => {
                    info!(server = %job.server.name, folder = %job.folder.path, count = files.len(), "files listed");
                    let wanted = st.auto_open.take().map(|auto| {
                        files
                            .iter()
                            .find(|f| !f.is_dir && f.name.eq_ignore_ascii_case(&auto.file))
                            .map(|f| f.name.clone())
                            .ok_or(auto.file)
                    });
                    self.inner.updates.submit(Update::Files {
                        server: job.server.name.clone(),
                        folder: folder_label(&job.folder),
                        files,
                    });
                    wanted
                }
                Err(err) if err.is_cancelled() => {
                    debug!(server = %job.server.name, "listing cancelled");
                    None
                }
                Err(err) if err.is_sudo_auth_failure() => {
                    warn!(server = %job.server.name, "sudo password rejected");
                    self.inner.pool.clear_sudo_password(&job.target);
                    st.pending = Some(job.kind);
                    self.inner.updates.submit(Update::SudoPrompt {
                        server: job.server.name.clone(),
                        retry: true,
                    });
                    None
                }
                Err(err) => {
                    error!(server = %job.server.name, error = %err, "listing failed");
                    st.stop_tail();
                    st.auto_open = None;
                    st.selection.folder = None;
                    st.selection.file = None;
                    self.inner.updates.submit(Update::Error {
                        message: format!("{}: {err}", job.server.name),
                        focus: Pane::Servers,
                    });
                    None
                }
            }
        };

        match auto_file {
            Some(Ok(name)) => {
                if let Err(err) = self.select_file(&name) {
                    warn!(file = %name, error = %err, "auto-open failed");
                }
            }
            Some(Err(name)) => {
                self.inner
                    .updates
                    .submit(Update::Status(format!("file {name} not found")));
            }
            None => {}
        }
    }

    /// Supplies the sudo password the last prompt asked for; `None` aborts.
    pub fn provide_sudo_password(&self, password: Option<Zeroizing<String>>) -> Result<(), CoreError> {
        let (pending, target) = {
            let mut st = self.inner.state.lock();
            let Some(pending) = st.pending.take() else {
                return Ok(());
            };
            if !st.is_current(pending.epoch()) {
                return Ok(());
            }
            let server_index = st
                .selection
                .server
                .ok_or_else(|| CoreError::Invalid("no server selected".to_string()))?;
            let target = to_target(self.server(server_index)?)?;
            if password.is_none() {
                match pending {
                    Pending::Listing { .. } | Pending::Refresh { .. } => {
                        st.stop_tail();
                        st.auto_open = None;
                        st.selection.folder = None;
                        st.selection.file = None;
                        self.inner.updates.submit(Update::Error {
                            message: "sudo password required".to_string(),
                            focus: Pane::Servers,
                        });
                    }
                    Pending::OpenFile { .. } => {
                        st.selection.file = None;
                        self.inner.updates.submit(Update::Error {
                            message: "sudo password required".to_string(),
                            focus: Pane::Files,
                        });
                    }
                }
                return Ok(());
            }
            (pending, target)
        };

        if let Some(password) = password {
            self.inner.pool.set_sudo_password(&target, password);
        }
        match pending {
            Pending::Listing { .. } => self.connect(),
            Pending::Refresh { .. } => self.refresh(),
            Pending::OpenFile { .. } => self.open_current_file(),
        }
    }

    /// Opens `name` in the current folder: shows its tail, then follows it.
    pub fn select_file(&self, name: &str) -> Result<(), CoreError> {
        {
            let mut st = self.inner.state.lock();
            if st.stopped {
                return Ok(());
            }
            if st.selection.folder.is_none() {
                return Err(CoreError::Invalid("no folder selected".to_string()));
            }
            st.stop_tail();
            st.advance();
            st.auto_open = None;
            st.selection.file = Some(name.to_string());
        }
        self.open_current_file()
    }

    fn open_current_file(&self) -> Result<(), CoreError> {
        let (job, file) = {
            let mut st = self.inner.state.lock();
            let epoch = st.selection.epoch;
            let file = st
                .selection
                .file
                .clone()
                .ok_or_else(|| CoreError::Invalid("no file selected".to_string()))?;
            match self.prepare_job(&mut st, Pending::OpenFile { epoch })? {
                Some(job) => (job, file),
                None => return Ok(()),
            }
        };
        let this = self.clone();
        tokio::spawn(async move { this.run_open_file(job, file).await });
        Ok(())
    }

    async fn run_open_file(&self, job: Job, file: String) {
        let path = join_remote(&job.folder.path, &file);
        let opts = self.command_opts(&job.target);
        let lines = self.inner.options.tail_lines;
        let result: Result<(Session, String), CoreError> = async {
            let session = self.inner.pool.get_client(&job.ctx, &job.target).await?;
            let content = job
                .ctx
                .run(read_file_content(session.as_ref(), &path, lines, &opts))
                .await?;
            Ok((session, content))
        }
        .await;

        let session = {
            let mut st = self.inner.state.lock();
            st.end_attempt(job.attempt);
            if !st.is_current(job.epoch) {
                return;
            }
            match result {
                Ok((session, content)) => {
                    self.inner.updates.submit(Update::FileContent {
                        file: file.clone(),
                        content,
                    });
                    session
                }
                Err(err) if err.is_cancelled() => return,
                Err(err) if err.is_sudo_auth_failure() => {
                    self.inner.pool.clear_sudo_password(&job.target);
                    st.pending = Some(job.kind);
                    self.inner.updates.submit(Update::SudoPrompt {
                        server: job.server.name.clone(),
                        retry: true,
                    });
                    return;
                }
                Err(err) => {
                    error!(path = %path, error = %err, "reading file failed");
                    st.selection.file = None;
                    self.inner.updates.submit(Update::Error {
                        message: format!("{file}: {err}"),
                        focus: Pane::Files,
                    });
                    return;
                }
            }
        };

        let sink = UpdateSink {
            coordinator: Arc::downgrade(&self.inner),
            updates: self.inner.updates.clone(),
            file: file.clone(),
            epoch: job.epoch,
        };
        let tailer = match start_tail(
            self.inner.root.token(),
            session.as_ref(),
            &path,
            0,
            Box::new(sink),
            &opts,
        )
        .await
        {
            Ok(tailer) => tailer,
            Err(err) => {
                if !err.is_cancelled() && self.inner.state.lock().is_current(job.epoch) {
                    self.inner.updates.submit(Update::Error {
                        message: format!("tail {file}: {err}"),
                        focus: Pane::Files,
                    });
                }
                return;
            }
        };

        let weak = Arc::downgrade(&self.inner);
        let (epoch, target, ended_file) = (job.epoch, job.target.clone(), file.clone());
        tailer.set_err_callback(Box::new(move |err| {
            if let Some(inner) = weak.upgrade() {
                on_tail_end(&inner, epoch, &target, &ended_file, err);
            }
        }));

        let mut st = self.inner.state.lock();
        if !st.is_current(job.epoch) {
            tailer.request_stop();
            return;
        }
        if tailer.err().is_some() {
            // Already ended and reported.
            return;
        }
        st.stop_tail();
        st.tail = Some(tailer);
    }

    /// Stops the active tail without waiting for it.
    pub fn stop_tail(&self) {
        let mut st = self.inner.state.lock();
        if st.tail.is_some() {
            st.stop_tail();
            self.inner
                .updates
                .submit(Update::Status("tail stopped".to_string()));
        }
    }

    /// Copies `file_name` from the current folder into `local_dir` in the background.
    pub fn download(&self, local_dir: &Path, file_name: &str) -> Result<(), CoreError> {
        let (server, folder) = {
            let st = self.inner.state.lock();
            if st.stopped {
                return Ok(());
            }
            let server_index = st
                .selection
                .server
                .ok_or_else(|| CoreError::Invalid("no server selected".to_string()))?;
            let folder = st
                .selection
                .folder
                .clone()
                .ok_or_else(|| CoreError::Invalid("no folder selected".to_string()))?;
            (self.server(server_index)?.clone(), folder)
        };
        let target = to_target(&server)?;
        let remote = join_remote(&folder.path, file_name);
        let local = local_dir.join(file_name);
        let ctx = self.inner.root.child();
        let connect_timeout = self.inner.options.connect_timeout;
        let this = self.clone();

        self.inner
            .updates
            .submit(Update::Status(format!("downloading {file_name}...")));
        tokio::spawn(async move {
            let opts = this.command_opts(&target);
            let result: Result<u64, CoreError> = async {
                let connect_ctx = ctx.child_with_timeout(connect_timeout);
                let session = this.inner.pool.get_client(&connect_ctx, &target).await?;
                let written = ctx
                    .run(download_file(session.as_ref(), &remote, &local, &opts))
                    .await?;
                Ok(written)
            }
            .await;
            match result {
                Ok(written) => {
                    info!(remote = %remote, local = %local.display(), bytes = written, "download complete");
                    this.inner.updates.submit(Update::Status(format!(
                        "downloaded {} ({}) to {}",
                        remote,
                        format_size(written),
                        local.display()
                    )));
                }
                Err(err) if err.is_cancelled() => {}
                Err(err) => {
                    if err.is_sudo_auth_failure() {
                        this.inner.pool.clear_sudo_password(&target);
                    }
                    error!(remote = %remote, error = %err, "download failed");
                    this.inner.updates.submit(Update::Error {
                        message: format!("download {remote}: {err}"),
                        focus: Pane::Files,
                    });
                }
            }
        });
        Ok(())
    }

    /// Selects a server by name, then optionally a folder (by path or name) and
    /// a file (by name, once the listing arrives). Names are case-insensitive.
    pub fn auto_select(
        &self,
        server: &str,
        folder: Option<&str>,
        file: Option<&str>,
    ) -> Result<(), CoreError> {
        let index = self
            .inner
            .servers
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(server))
            .ok_or_else(|| CoreError::NotFound(format!("server {server}")))?;
        let config = &self.inner.servers[index];
        let folder_index = match folder {
            Some(wanted) if config.has_multiple_folders() => Some(
                config
                    .effective_folders()
                    .iter()
                    .position(|f| f.path == wanted || f.name.eq_ignore_ascii_case(wanted))
                    .ok_or_else(|| CoreError::NotFound(format!("folder {wanted} on {server}")))?,
            ),
            _ => None,
        };

        // Set before selecting: a single-folder server starts listing right away.
        self.inner.state.lock().auto_open = file.map(|file| AutoOpen {
            server: index,
            folder: folder_index
                .and_then(|i| config.effective_folders().into_iter().nth(i))
                .map(|f| f.path),
            file: file.to_string(),
        });
        self.select_server(index)?;
        if let Some(folder_index) = folder_index {
            self.select_folder(folder_index)?;
        }
        Ok(())
    }

    /// Stops everything. Waits at most the configured shutdown timeout for
    /// the tail, then closes pooled connections.
    pub async fn shutdown(&self) {
        let tail = {
            let mut st = self.inner.state.lock();
            if st.stopped {
                return;
            }
            st.stopped = true;
            st.pending = None;
            st.cancel_connect();
            st.tail.take()
        };
        info!("shutting down");
        self.inner.updates.shutdown();
        self.inner.root.cancel();

        let timeout = self.inner.options.shutdown_timeout;
        if let Some(tail) = tail {
            if !tail.await_stop(timeout).await {
                warn!(path = tail.path(), "tail did not stop in time");
            }
        }
        if tokio::time::timeout(timeout, self.inner.pool.close_all())
            .await
            .is_err()
        {
            warn!("closing connections timed out");
        }
    }

    fn command_opts(&self, target: &Target) -> CommandOpts {
        if !target.sudo {
            return CommandOpts::default();
        }
        match self.inner.pool.sudo_password(target) {
            Some(password) => CommandOpts::sudo(password),
            None => CommandOpts::default(),
        }
    }
}

fn on_tail_end(inner: &Inner, epoch: u64, target: &Target, file: &str, err: SshError) {
    let mut st = inner.state.lock();
    if err.is_sudo_auth_failure() {
        inner.pool.clear_sudo_password(target);
    }
    if !st.is_current(epoch) {
        return;
    }
    st.tail = None;
    let message = match err {
        SshError::StreamEnded => "Disconnected".to_string(),
        other => format!("Disconnected: {other}"),
    };
    inner.updates.submit(Update::TailEnded {
        file: file.to_string(),
        message,
    });
}

/// Streams tail output into the update queue while its file is still selected.
struct UpdateSink {
    coordinator: Weak<Inner>,
    updates: UpdateDispatcher,
    file: String,
    epoch: u64,
}

#[async_trait]
impl TailSink for UpdateSink {
    async fn write(&mut self, data: Bytes) -> Result<(), SshError> {
        let current = self
            .coordinator
            .upgrade()
            .is_some_and(|inner| inner.state.lock().is_current(self.epoch));
        if !current {
            return Ok(());
        }
        let delivered = self
            .updates
            .deliver(Update::TailData {
                file: self.file.clone(),
                data,
            })
            .await;
        if delivered {
            Ok(())
        } else {
            Err(SshError::Io("update queue closed".to_string()))
        }
    }
}

pub fn to_target(server: &ServerConfig) -> Result<Target, CoreError> {
    let auth_method = match server.auth_method() {
        AuthKind::Key => AuthMethod::Key {
            private_key_path: server.auth.key_path.clone().ok_or_else(|| {
                CoreError::Invalid(format!(
                    "{}: key auth needs auth.key_path or defaults.ssh_key",
                    server.name
                ))
            })?,
        },
        AuthKind::Agent => AuthMethod::Agent,
        AuthKind::Password => AuthMethod::Password,
    };
    Ok(Target {
        host: server.host.clone(),
        port: server.port,
        username: server.user.clone(),
        auth_method,
        sudo: server.sudo,
    })
}

fn folder_label(folder: &LogFolder) -> String {
    if folder.name.is_empty() {
        folder.path.clone()
    } else {
        folder.name.clone()
    }
}

fn join_remote(dir: &str, name: &str) -> String {
    format!("{}/{name}", dir.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::UpdateReceiver;
    use logmon_config::AuthConfig;
    use logmon_ssh::testing::{Feed, MockConnector, Script};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const LISTING: &str = "\
total 8
-rw-r--r-- 1 root root 10 2024-01-15 10:30:00.000000000 +0000 app.log
-rw-r--r-- 1 root root 20 2024-01-15 10:31:00.000000000 +0000 other.txt
";

    fn server(name: &str, host: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            host: host.to_string(),
            port: 22,
            user: "ops".to_string(),
            auth: AuthConfig {
                method: Some(AuthKind::Agent),
                key_path: None,
            },
            log_path: Some("/var/log/app".to_string()),
            file_patterns: Vec::new(),
            log_folders: Vec::new(),
            sudo: false,
        }
    }

    fn multi_folder(name: &str, host: &str) -> ServerConfig {
        let mut s = server(name, host);
        s.log_path = None;
        s.log_folders = vec![
            LogFolder {
                name: "nginx".to_string(),
                path: "/var/log/nginx".to_string(),
                file_patterns: Vec::new(),
            },
            LogFolder {
                name: "app".to_string(),
                path: "/srv/app/logs".to_string(),
                file_patterns: vec!["*.log".to_string()],
            },
        ];
        s
    }

    fn respond(command: &str) -> Script {
        if command.contains("ls -la") {
            Script::stdout(LISTING)
        } else if command.contains(" -f ") {
            Script::events(Vec::new()).hang()
        } else if command.contains("tail -n") {
            Script::stdout("line1\nline2\n")
        } else {
            Script::exit(Vec::new(), 0)
        }
    }

    struct Harness {
        coordinator: Coordinator,
        connector: Arc<MockConnector>,
        pool: Arc<ConnectionPool>,
        rx: UpdateReceiver,
    }

    fn harness(servers: Vec<ServerConfig>, connector: MockConnector) -> Harness {
        let connector = Arc::new(connector);
        let pool = Arc::new(ConnectionPool::new(
            connector.clone(),
            Duration::from_secs(5),
        ));
        let (updates, rx) = UpdateDispatcher::new(64);
        let coordinator = Coordinator::new(
            servers,
            pool.clone(),
            updates,
            CoordinatorOptions::default(),
        );
        Harness {
            coordinator,
            connector,
            pool,
            rx,
        }
    }

    async fn next_update(rx: &mut UpdateReceiver, wanted: impl Fn(&Update) -> bool) -> Update {
        loop {
            let update = tokio::time::timeout(Duration::from_secs(30), rx.recv())
                .await
                .expect("timed out waiting for update")
                .expect("update channel closed");
            if wanted(&update) {
                return update;
            }
        }
    }

    fn is_files(update: &Update) -> bool {
        matches!(update, Update::Files { .. })
    }

    async fn wait_for_tail(coordinator: &Coordinator) {
        for _ in 0..100 {
            if coordinator.has_active_tail() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("tail never became active");
    }

    #[tokio::test]
    async fn single_folder_server_lists_files() {
        let mut h = harness(
            vec![server("alpha", "alpha.internal")],
            MockConnector::new().with_responder(respond),
        );
        h.coordinator.select_server(0).unwrap();

        match next_update(&mut h.rx, |u| matches!(u, Update::Connecting { .. })).await {
            Update::Connecting { server, folder } => {
                assert_eq!(server, "alpha");
                assert_eq!(folder, "/var/log/app");
            }
            other => panic!("unexpected {other:?}"),
        }
        match next_update(&mut h.rx, is_files).await {
            Update::Files { server, files, .. } => {
                assert_eq!(server, "alpha");
                let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
                assert_eq!(names, ["app.log", "other.txt"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        let session = h.connector.last_session().unwrap();
        assert_eq!(
            session.commands(),
            vec!["ls -la --time-style=full-iso /var/log/app".to_string()]
        );
    }

    #[tokio::test]
    async fn multi_folder_server_offers_folders_first() {
        let mut h = harness(
            vec![multi_folder("beta", "beta.internal")],
            MockConnector::new().with_responder(respond),
        );
        h.coordinator.select_server(0).unwrap();
        match next_update(&mut h.rx, |u| matches!(u, Update::Folders { .. })).await {
            Update::Folders { folders, .. } => assert_eq!(folders.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.connector.dial_count(), 0);

        h.coordinator.select_folder(1).unwrap();
        match next_update(&mut h.rx, is_files).await {
            Update::Files { folder, files, .. } => {
                assert_eq!(folder, "app");
                assert_eq!(files.len(), 1);
                assert_eq!(files[0].name, "app.log");
            }
            other => panic!("unexpected {other:?}"),
        }

        h.coordinator.up_directory();
        next_update(&mut h.rx, |u| matches!(u, Update::Folders { .. })).await;
        assert!(h.coordinator.selection().folder.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn only_latest_selection_publishes() {
        let connector = MockConnector::new().with_responder(respond);
        connector.set_delay("slow.internal", Duration::from_secs(2));
        let mut h = harness(
            vec![server("slow", "slow.internal"), server("fast", "fast.internal")],
            connector,
        );
        h.coordinator.select_server(0).unwrap();
        h.coordinator.select_server(1).unwrap();

        match next_update(&mut h.rx, is_files).await {
            Update::Files { server, .. } => assert_eq!(server, "fast"),
            other => panic!("unexpected {other:?}"),
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        while let Ok(update) = h.rx.try_recv() {
            if let Update::Files { server, .. } = update {
                panic!("stale listing from {server} published");
            }
        }
        assert_eq!(h.pool.cached_count(), 1);
    }

    #[tokio::test]
    async fn rejected_sudo_password_is_cleared_and_reprompted() {
        let listings = Arc::new(AtomicUsize::new(0));
        let counter = listings.clone();
        let connector = MockConnector::new().with_responder(move |command| {
            if command.starts_with("sudo -S ls") && counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Script::exit(
                    vec![logmon_ssh::ChannelEvent::Stderr(Bytes::from_static(
                        b"[sudo] password for ops: Sorry, try again.\n",
                    ))],
                    1,
                );
            }
            respond(command)
        });
        let mut cfg = server("secure", "secure.internal");
        cfg.sudo = true;
        let target = to_target(&cfg).unwrap();
        let mut h = harness(vec![cfg], connector);

        h.coordinator.select_server(0).unwrap();
        match next_update(&mut h.rx, |u| matches!(u, Update::SudoPrompt { .. })).await {
            Update::SudoPrompt { retry, .. } => assert!(!retry),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.connector.dial_count(), 0);

        h.coordinator
            .provide_sudo_password(Some(Zeroizing::new("wrong".to_string())))
            .unwrap();
        match next_update(&mut h.rx, |u| matches!(u, Update::SudoPrompt { .. })).await {
            Update::SudoPrompt { retry, .. } => assert!(retry),
            other => panic!("unexpected {other:?}"),
        }
        assert!(h.pool.sudo_password(&target).is_none());

        h.coordinator
            .provide_sudo_password(Some(Zeroizing::new("right".to_string())))
            .unwrap();
        next_update(&mut h.rx, is_files).await;
        assert_eq!(
            h.pool.sudo_password(&target).as_deref().map(String::as_str),
            Some("right")
        );
        assert_eq!(listings.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn declining_sudo_returns_to_servers() {
        let mut cfg = server("secure", "secure.internal");
        cfg.sudo = true;
        let mut h = harness(vec![cfg], MockConnector::new().with_responder(respond));
        h.coordinator.select_server(0).unwrap();
        next_update(&mut h.rx, |u| matches!(u, Update::SudoPrompt { .. })).await;

        h.coordinator.provide_sudo_password(None).unwrap();
        match next_update(&mut h.rx, |u| matches!(u, Update::Error { .. })).await {
            Update::Error { focus, .. } => assert_eq!(focus, Pane::Servers),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.connector.dial_count(), 0);
    }

    #[tokio::test]
    async fn connection_failure_returns_focus_to_servers() {
        let connector = MockConnector::new().with_responder(respond);
        connector.fail(
            "down.internal",
            SshError::Dial {
                addr: "down.internal:22".to_string(),
                message: "connection refused".to_string(),
            },
        );
        let mut h = harness(vec![server("down", "down.internal")], connector);
        h.coordinator.select_server(0).unwrap();
        match next_update(&mut h.rx, |u| matches!(u, Update::Error { .. })).await {
            Update::Error { message, focus } => {
                assert_eq!(focus, Pane::Servers);
                assert!(message.contains("connection refused"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn opened_file_streams_until_remote_ends() {
        let connector = MockConnector::new().with_responder(|command| {
            if command.contains(" -f ") {
                Script::stdout("fresh line\n")
            } else {
                respond(command)
            }
        });
        let mut h = harness(vec![server("alpha", "alpha.internal")], connector);
        h.coordinator.select_server(0).unwrap();
        next_update(&mut h.rx, is_files).await;

        h.coordinator.select_file("app.log").unwrap();
        match next_update(&mut h.rx, |u| matches!(u, Update::FileContent { .. })).await {
            Update::FileContent { file, content } => {
                assert_eq!(file, "app.log");
                assert_eq!(content, "line1\nline2\n");
            }
            other => panic!("unexpected {other:?}"),
        }
        match next_update(&mut h.rx, |u| matches!(u, Update::TailData { .. })).await {
            Update::TailData { data, .. } => assert_eq!(data, Bytes::from_static(b"fresh line\n")),
            other => panic!("unexpected {other:?}"),
        }
        match next_update(&mut h.rx, |u| matches!(u, Update::TailEnded { .. })).await {
            Update::TailEnded { file, message } => {
                assert_eq!(file, "app.log");
                assert_eq!(message, "Disconnected");
            }
            other => panic!("unexpected {other:?}"),
        }
        let commands = h.connector.last_session().unwrap().commands();
        assert!(commands.contains(&"tail -n 100 /var/log/app/app.log".to_string()));
        assert!(commands.contains(&"tail -n 0 -f /var/log/app/app.log".to_string()));
    }

    #[tokio::test]
    async fn refresh_reuses_connection_and_keeps_tail() {
        let mut h = harness(
            vec![server("alpha", "alpha.internal")],
            MockConnector::new().with_responder(respond),
        );
        h.coordinator.select_server(0).unwrap();
        next_update(&mut h.rx, is_files).await;
        h.coordinator.select_file("app.log").unwrap();
        wait_for_tail(&h.coordinator).await;

        h.coordinator.refresh().unwrap();
        next_update(&mut h.rx, is_files).await;
        assert_eq!(h.connector.dial_count(), 1);
        assert!(h.coordinator.has_active_tail());

        h.coordinator.stop_tail();
        assert!(!h.coordinator.has_active_tail());
    }

    #[tokio::test]
    async fn auto_select_opens_named_file() {
        let mut h = harness(
            vec![server("alpha", "alpha.internal"), server("beta", "beta.internal")],
            MockConnector::new().with_responder(respond),
        );
        h.coordinator
            .auto_select("BETA", None, Some("APP.LOG"))
            .unwrap();
        match next_update(&mut h.rx, |u| matches!(u, Update::FileContent { .. })).await {
            Update::FileContent { file, .. } => assert_eq!(file, "app.log"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.coordinator.selection().server, Some(1));
        assert!(matches!(
            h.coordinator.auto_select("gamma", None, None),
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn download_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        let connector = MockConnector::new().with_responder(|command| {
            if command.starts_with("cat ") {
                Script::stdout(&"x".repeat(1536))
            } else {
                respond(command)
            }
        });
        let mut h = harness(vec![server("alpha", "alpha.internal")], connector);
        h.coordinator.select_server(0).unwrap();
        next_update(&mut h.rx, is_files).await;

        h.coordinator.download(dir.path(), "app.log").unwrap();
        let done = next_update(&mut h.rx, |u| {
            matches!(u, Update::Status(text) if text.starts_with("downloaded"))
        })
        .await;
        match done {
            Update::Status(text) => assert!(text.contains("(1.5K)")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            std::fs::read(dir.path().join("app.log")).unwrap().len(),
            1536
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_bounded_when_tail_hangs() {
        let connector = MockConnector::new().with_responder(|command| {
            if command.contains(" -f ") {
                Script::events(Vec::new()).hang().hang_on_signal()
            } else {
                respond(command)
            }
        });
        let mut h = harness(vec![server("alpha", "alpha.internal")], connector);
        h.coordinator.select_server(0).unwrap();
        next_update(&mut h.rx, is_files).await;
        h.coordinator.select_file("app.log").unwrap();
        wait_for_tail(&h.coordinator).await;

        tokio::time::timeout(Duration::from_secs(10), h.coordinator.shutdown())
            .await
            .expect("shutdown must not hang");
        assert_eq!(h.connector.last_session().unwrap().close_count(), 1);
        assert_eq!(h.pool.cached_count(), 0);

        // Intents after shutdown are ignored.
        h.coordinator.select_server(0).unwrap();
        assert_eq!(h.connector.dial_count(), 1);
    }

    fn mentions(update: &Update, name: &str) -> bool {
        match update {
            Update::FileContent { file, .. }
            | Update::TailData { file, .. }
            | Update::TailEnded { file, .. } => file == name,
            Update::Error { message, .. } => message.contains(name),
            _ => false,
        }
    }

    fn drain(rx: &mut UpdateReceiver) -> Vec<Update> {
        let mut seen = Vec::new();
        while let Ok(update) = rx.try_recv() {
            seen.push(update);
        }
        seen
    }

    /// Responder whose `tail -f` for `file` is a live stream handed to the test.
    fn streaming(file: &'static str, feed: Arc<Mutex<Option<Feed>>>) -> MockConnector {
        MockConnector::new().with_responder(move |command| {
            if command.contains(" -f ") && command.ends_with(file) {
                let (script, live) = Script::stream();
                *feed.lock() = Some(live);
                script
            } else {
                respond(command)
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn listing_arrives_while_tail_output_backs_up() {
        let feed = Arc::new(Mutex::new(None));
        let mut h = harness(
            vec![server("alpha", "alpha.internal")],
            streaming("app.log", feed.clone()),
        );
        h.coordinator.select_server(0).unwrap();
        next_update(&mut h.rx, is_files).await;
        h.coordinator.select_file("app.log").unwrap();
        next_update(&mut h.rx, |u| matches!(u, Update::FileContent { .. })).await;
        wait_for_tail(&h.coordinator).await;

        let live = feed.lock().take().expect("tail stream started");
        for i in 0..200 {
            live.line(&format!("line {i}\n"));
        }
        // The tail sink is now parked waiting for room in the queue.
        tokio::time::sleep(Duration::from_millis(100)).await;

        h.coordinator.refresh().unwrap();
        match next_update(&mut h.rx, is_files).await {
            Update::Files { files, .. } => assert_eq!(files.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        assert!(h.coordinator.has_active_tail());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_leaves_file_being_opened_alone() {
        let connector = MockConnector::new().with_responder(|command| {
            if command.starts_with("tail -n 100 ") {
                Script::events(Vec::new()).hang()
            } else {
                respond(command)
            }
        });
        let mut h = harness(vec![server("alpha", "alpha.internal")], connector);
        h.coordinator.select_server(0).unwrap();
        next_update(&mut h.rx, is_files).await;

        h.coordinator.select_file("app.log").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.coordinator.refresh().unwrap();
        next_update(&mut h.rx, is_files).await;

        // The open is still bounded by its own deadline and reports the outcome.
        let outcome = next_update(&mut h.rx, |u| {
            matches!(u, Update::FileContent { .. } | Update::Error { .. })
        })
        .await;
        match outcome {
            Update::Error { message, focus } => {
                assert_eq!(focus, Pane::Files);
                assert!(message.starts_with("app.log"), "{message}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_file_open_publishes_nothing() {
        let connector = MockConnector::new().with_responder(|command| {
            if command == "tail -n 100 /var/log/app/app.log" {
                Script::events(Vec::new()).hang()
            } else {
                respond(command)
            }
        });
        let mut h = harness(vec![server("alpha", "alpha.internal")], connector);
        h.coordinator.select_server(0).unwrap();
        next_update(&mut h.rx, is_files).await;

        h.coordinator.select_file("app.log").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.coordinator.select_file("other.txt").unwrap();
        match next_update(&mut h.rx, |u| matches!(u, Update::FileContent { .. })).await {
            Update::FileContent { file, .. } => assert_eq!(file, "other.txt"),
            other => panic!("unexpected {other:?}"),
        }
        wait_for_tail(&h.coordinator).await;

        tokio::time::sleep(Duration::from_secs(20)).await;
        for update in drain(&mut h.rx) {
            assert!(!mentions(&update, "app.log"), "stale update {update:?}");
        }
        let commands = h.connector.last_session().unwrap().commands();
        assert!(!commands.contains(&"tail -n 0 -f /var/log/app/app.log".to_string()));
        assert!(commands.contains(&"tail -n 0 -f /var/log/app/other.txt".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn previous_tail_output_is_dropped_after_switch() {
        let feed = Arc::new(Mutex::new(None));
        let mut h = harness(
            vec![server("alpha", "alpha.internal")],
            streaming("app.log", feed.clone()),
        );
        h.coordinator.select_server(0).unwrap();
        next_update(&mut h.rx, is_files).await;
        h.coordinator.select_file("app.log").unwrap();
        wait_for_tail(&h.coordinator).await;
        let live = feed.lock().take().expect("tail stream started");
        live.line("before\n");
        match next_update(&mut h.rx, |u| matches!(u, Update::TailData { .. })).await {
            Update::TailData { file, .. } => assert_eq!(file, "app.log"),
            other => panic!("unexpected {other:?}"),
        }

        h.coordinator.select_file("other.txt").unwrap();
        next_update(&mut h.rx, |u| {
            matches!(u, Update::FileContent { file, .. } if file == "other.txt")
        })
        .await;
        live.line("after\n");
        drop(live);

        tokio::time::sleep(Duration::from_secs(1)).await;
        for update in drain(&mut h.rx) {
            assert!(!mentions(&update, "app.log"), "stale update {update:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn auto_open_is_forgotten_when_user_picks_another_server() {
        let mut h = harness(
            vec![server("alpha", "alpha.internal"), server("beta", "beta.internal")],
            MockConnector::new().with_responder(respond),
        );
        h.coordinator
            .auto_select("alpha", None, Some("app.log"))
            .unwrap();
        h.coordinator.select_server(1).unwrap();
        match next_update(&mut h.rx, is_files).await {
            Update::Files { server, .. } => assert_eq!(server, "beta"),
            other => panic!("unexpected {other:?}"),
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(drain(&mut h.rx)
            .iter()
            .all(|u| !matches!(u, Update::FileContent { .. })));
        assert!(h.coordinator.selection().file.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_listing_forgets_auto_open() {
        let listings = Arc::new(AtomicUsize::new(0));
        let counter = listings.clone();
        let connector = MockConnector::new().with_responder(move |command| {
            if command.starts_with("ls -la") && counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Script::exit(
                    vec![logmon_ssh::ChannelEvent::Stderr(Bytes::from_static(
                        b"ls: cannot open directory '/var/log/app': Permission denied\n",
                    ))],
                    2,
                );
            }
            respond(command)
        });
        let mut h = harness(vec![server("alpha", "alpha.internal")], connector);
        h.coordinator
            .auto_select("alpha", None, Some("app.log"))
            .unwrap();
        next_update(&mut h.rx, |u| matches!(u, Update::Error { .. })).await;

        h.coordinator.select_server(0).unwrap();
        next_update(&mut h.rx, is_files).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(drain(&mut h.rx)
            .iter()
            .all(|u| !matches!(u, Update::FileContent { .. })));
        assert!(!h.coordinator.has_active_tail());
    }

    #[tokio::test]
    async fn declining_refresh_prompt_stops_tail() {
        let listings = Arc::new(AtomicUsize::new(0));
        let counter = listings.clone();
        let connector = MockConnector::new().with_responder(move |command| {
            if command.starts_with("sudo -S ls") && counter.fetch_add(1, Ordering::SeqCst) == 1 {
                return Script::exit(
                    vec![logmon_ssh::ChannelEvent::Stderr(Bytes::from_static(
                        b"Sorry, try again.\n",
                    ))],
                    1,
                );
            }
            respond(command)
        });
        let mut cfg = server("secure", "secure.internal");
        cfg.sudo = true;
        let mut h = harness(vec![cfg], connector);
        h.coordinator.select_server(0).unwrap();
        next_update(&mut h.rx, |u| matches!(u, Update::SudoPrompt { .. })).await;
        h.coordinator
            .provide_sudo_password(Some(Zeroizing::new("pw".to_string())))
            .unwrap();
        next_update(&mut h.rx, is_files).await;
        h.coordinator.select_file("app.log").unwrap();
        wait_for_tail(&h.coordinator).await;

        h.coordinator.refresh().unwrap();
        match next_update(&mut h.rx, |u| matches!(u, Update::SudoPrompt { .. })).await {
            Update::SudoPrompt { retry, .. } => assert!(retry),
            other => panic!("unexpected {other:?}"),
        }
        assert!(h.coordinator.has_active_tail());

        h.coordinator.provide_sudo_password(None).unwrap();
        match next_update(&mut h.rx, |u| matches!(u, Update::Error { .. })).await {
            Update::Error { focus, .. } => assert_eq!(focus, Pane::Servers),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!h.coordinator.has_active_tail());
        assert!(h.coordinator.selection().folder.is_none());
        assert!(h.coordinator.selection().file.is_none());
    }
}
