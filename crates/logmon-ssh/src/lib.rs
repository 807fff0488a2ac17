pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod exec;
pub mod fileops;
pub mod pool;
pub mod session;
pub mod tailer;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::{SshClient, SshSession};
pub use config::{AuthMethod, ConnectOptions, Target};
pub use context::CallContext;
pub use error::SshError;
pub use exec::{run_command, shell_quote, CommandOpts};
pub use fileops::{
    download_file, format_size, list_files, read_file_content, stat_file, FileEntry,
};
pub use pool::ConnectionPool;
pub use session::{ChannelEvent, Connector, RemoteChannel, RemoteSession, Session, Signal};
pub use tailer::{start_tail, ErrCallback, TailSink, Tailer, WriterSink};
