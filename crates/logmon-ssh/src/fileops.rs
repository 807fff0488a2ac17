use crate::error::SshError;
use crate::exec::{check_exit, run_command, shell_quote, start, CommandOpts};
use crate::session::{ChannelEvent, RemoteSession};
use chrono::{DateTime, NaiveDateTime};
use glob::Pattern;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// One row of a remote directory listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub modified: Option<NaiveDateTime>,
    pub is_dir: bool,
}

/// Lists `dir`, keeping entries whose name matches any of `patterns`
/// (all entries when `patterns` is empty). Sorted by name.
pub async fn list_files(
    session: &dyn RemoteSession,
    dir: &str,
    patterns: &[String],
    opts: &CommandOpts,
) -> Result<Vec<FileEntry>, SshError> {
    let command = format!("ls -la --time-style=full-iso {}", shell_quote(dir));
    let output = run_command(session, &command, opts).await?;
    let mut entries = parse_ls_output(&output);
    if !patterns.is_empty() {
        entries = filter_by_patterns(entries, patterns);
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    debug!(dir, count = entries.len(), "listed remote directory");
    Ok(entries)
}

/// Last `lines` lines of `path`.
pub async fn read_file_content(
    session: &dyn RemoteSession,
    path: &str,
    lines: u32,
    opts: &CommandOpts,
) -> Result<String, SshError> {
    let command = format!("tail -n {lines} {}", shell_quote(path));
    run_command(session, &command, opts).await
}

pub async fn stat_file(
    session: &dyn RemoteSession,
    path: &str,
    opts: &CommandOpts,
) -> Result<FileEntry, SshError> {
    let command = format!("stat --format='%n %s %Y %F' {}", shell_quote(path));
    let output = run_command(session, &command, opts).await?;
    parse_stat_output(&output)
}

/// Streams `remote` into `local` with `cat`, creating parent directories.
/// Returns the number of bytes written.
pub async fn download_file(
    session: &dyn RemoteSession,
    remote: &str,
    local: &Path,
    opts: &CommandOpts,
) -> Result<u64, SshError> {
    if let Some(parent) = local.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SshError::Io(format!("creating {}: {e}", parent.display())))?;
    }
    let mut file = tokio::fs::File::create(local)
        .await
        .map_err(|e| SshError::Io(format!("creating {}: {e}", local.display())))?;

    let command = format!("cat {}", shell_quote(remote));
    info!(remote, local = %local.display(), sudo = opts.is_sudo(), "downloading");
    let mut channel = start(session, &command, opts).await?;
    let mut written = 0u64;
    let mut stderr = Vec::new();
    let mut status = None;
    while let Some(event) = channel.next_event().await {
        match event {
            ChannelEvent::Stdout(data) => {
                file.write_all(&data)
                    .await
                    .map_err(|e| SshError::Io(format!("writing {}: {e}", local.display())))?;
                written += data.len() as u64;
            }
            ChannelEvent::Stderr(data) => stderr.extend_from_slice(&data),
            ChannelEvent::Exit(code) => status = Some(code),
            ChannelEvent::Signaled(_) => {}
        }
    }
    file.flush().await?;

    let stderr = String::from_utf8_lossy(&stderr);
    check_exit(&command, status, &stderr, opts, || stderr.to_string())?;
    Ok(written)
}

/// Human-readable size: `512B`, `1.5K`, `3.2M`, `1.0G`.
pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let size = bytes as f64;
    if size < KB {
        format!("{bytes}B")
    } else if size < MB {
        format!("{:.1}K", size / KB)
    } else if size < GB {
        format!("{:.1}M", size / MB)
    } else {
        format!("{:.1}G", size / GB)
    }
}

fn filter_by_patterns(entries: Vec<FileEntry>, patterns: &[String]) -> Vec<FileEntry> {
    let compiled: Vec<Pattern> = patterns
        .iter()
        .filter_map(|p| Pattern::new(p).ok())
        .collect();
    entries
        .into_iter()
        .filter(|entry| compiled.iter().any(|p| p.matches(&entry.name)))
        .collect()
}

// permissions links owner group size date time zone name...
fn parse_ls_output(output: &str) -> Vec<FileEntry> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("total") {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }
        let name = fields[8..].join(" ");
        if name == "." || name == ".." {
            continue;
        }
        let size = fields[4].parse().unwrap_or(0);
        let time = fields[6].split('.').next().unwrap_or(fields[6]);
        let modified =
            NaiveDateTime::parse_from_str(&format!("{} {time}", fields[5]), "%Y-%m-%d %H:%M:%S")
                .ok();
        entries.push(FileEntry {
            name,
            size,
            modified,
            is_dir: fields[0].starts_with('d'),
        });
    }
    entries
}

fn parse_stat_output(output: &str) -> Result<FileEntry, SshError> {
    let parts: Vec<&str> = output.split_whitespace().collect();
    if parts.len() < 4 {
        return Err(SshError::Parse(format!(
            "unexpected stat output: {}",
            output.trim()
        )));
    }
    let name = Path::new(parts[0])
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| parts[0].to_string());
    let modified = parts[2]
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|dt| dt.naive_utc());
    Ok(FileEntry {
        name,
        size: parts[1].parse().unwrap_or(0),
        modified,
        // `%F` prints "regular file", "directory", ...
        is_dir: parts[3] == "directory",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockSession, Script};
    use bytes::Bytes;
    use zeroize::Zeroizing;

    const LISTING: &str = "\
total 24
drwxr-xr-x  2 root root 4096 2024-01-15 10:30:00.000000000 +0000 .
drwxr-xr-x 14 root root 4096 2024-01-10 08:00:00.000000000 +0000 ..
-rw-r--r--  1 root root 1234 2024-01-15 10:30:00.123456789 +0000 a.log
-rw-r--r--  1 root root   99 2024-01-14 09:00:00.000000000 +0000 b.txt
-rw-r--r--  1 root root 5678 2024-01-13 07:15:42.000000000 +0000 a.log.1
drwxr-xr-x  2 root root 4096 2024-01-12 06:00:00.000000000 +0000 archive
";

    #[test]
    fn parses_full_iso_listing() {
        let entries = parse_ls_output(LISTING);
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a.log", "b.txt", "a.log.1", "archive"]);
        assert_eq!(entries[0].size, 1234);
        assert_eq!(
            entries[0].modified,
            NaiveDateTime::parse_from_str("2024-01-15 10:30:00", "%Y-%m-%d %H:%M:%S").ok()
        );
        assert!(!entries[0].is_dir);
        assert!(entries[3].is_dir);
    }

    #[test]
    fn names_with_spaces_survive() {
        let entries = parse_ls_output(
            "-rw-r--r-- 1 app app 10 2024-02-01 12:00:00.5 +0100 my  app log.txt\n",
        );
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "my app log.txt");
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let output = "\
garbage
-rw-r--r-- 1 root root
-rw-r--r-- 1 root root notanumber baddate badtime +0000 odd.log
-rw-r--r-- 1 root root 42 2024-01-15 10:30:00.0 +0000 good.log
";
        let entries = parse_ls_output(output);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "odd.log");
        assert_eq!(entries[0].size, 0);
        assert_eq!(entries[0].modified, None);
        assert_eq!(entries[1].name, "good.log");
        assert_eq!(entries[1].size, 42);
    }

    #[tokio::test]
    async fn list_filters_and_sorts() {
        let session = MockSession::new("ops@a:22").with_responder(|_| Script::stdout(LISTING));
        let patterns = vec!["*.log*".to_string()];
        let entries = list_files(&session, "/var/log/app", &patterns, &CommandOpts::default())
            .await
            .unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a.log", "a.log.1"]);
        assert_eq!(
            session.commands(),
            vec!["ls -la --time-style=full-iso /var/log/app".to_string()]
        );
    }

    #[tokio::test]
    async fn invalid_patterns_never_match() {
        let session = MockSession::new("ops@a:22").with_responder(|_| Script::stdout(LISTING));
        let patterns = vec!["[".to_string(), "*.txt".to_string()];
        let entries = list_files(&session, "/logs", &patterns, &CommandOpts::default())
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "b.txt");
    }

    #[tokio::test]
    async fn read_tail_quotes_path() {
        let session = MockSession::new("ops@a:22").with_responder(|_| Script::stdout("l1\nl2\n"));
        let out = read_file_content(&session, "/var/log/my app.log", 50, &CommandOpts::default())
            .await
            .unwrap();
        assert_eq!(out, "l1\nl2\n");
        assert_eq!(
            session.commands(),
            vec!["tail -n 50 '/var/log/my app.log'".to_string()]
        );
    }

    #[tokio::test]
    async fn stat_parses_fields() {
        let session = MockSession::new("ops@a:22")
            .with_responder(|_| Script::stdout("/var/log/syslog 2048 1705314600 regular file\n"));
        let entry = stat_file(&session, "/var/log/syslog", &CommandOpts::default())
            .await
            .unwrap();
        assert_eq!(entry.name, "syslog");
        assert_eq!(entry.size, 2048);
        assert!(!entry.is_dir);
        assert_eq!(
            entry.modified,
            DateTime::from_timestamp(1_705_314_600, 0).map(|d| d.naive_utc())
        );
    }

    #[tokio::test]
    async fn stat_rejects_short_output() {
        let session = MockSession::new("ops@a:22").with_responder(|_| Script::stdout("oops\n"));
        let err = stat_file(&session, "/x", &CommandOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::Parse(_)));
    }

    #[tokio::test]
    async fn download_writes_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("nested").join("app.log");
        let session = MockSession::new("ops@a:22").with_responder(|_| {
            Script::exit(
                vec![
                    ChannelEvent::Stdout(Bytes::from_static(b"first\n")),
                    ChannelEvent::Stdout(Bytes::from_static(b"second\n")),
                ],
                0,
            )
        });
        let written = download_file(&session, "/var/log/app.log", &local, &CommandOpts::default())
            .await
            .unwrap();
        assert_eq!(written, 13);
        assert_eq!(std::fs::read_to_string(&local).unwrap(), "first\nsecond\n");
        assert_eq!(session.commands(), vec!["cat /var/log/app.log".to_string()]);
    }

    #[tokio::test]
    async fn download_with_bad_sudo_password() {
        let dir = tempfile::tempdir().unwrap();
        let session = MockSession::new("ops@a:22").with_responder(|_| {
            Script::exit(
                vec![ChannelEvent::Stderr(Bytes::from_static(b"Sorry, try again.\n"))],
                1,
            )
        });
        let opts = CommandOpts::sudo(Zeroizing::new("nope".to_string()));
        let err = download_file(&session, "/root/secret.log", &dir.path().join("s.log"), &opts)
            .await
            .unwrap_err();
        assert_eq!(err, SshError::SudoAuthFailed);
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(0), "0B");
        assert_eq!(format_size(1023), "1023B");
        assert_eq!(format_size(1536), "1.5K");
        assert_eq!(format_size(1_048_576), "1.0M");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024), "5.0G");
    }
}
