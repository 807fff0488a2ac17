//! Line-mode front end: reads commands from stdin and prints updates.

use anyhow::Result;
use logmon_config::LogFolder;
use logmon_core::{Coordinator, Pane, Update, UpdateReceiver};
use logmon_ssh::{format_size, FileEntry};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use zeroize::Zeroizing;

const HELP: &str = "\
commands:
  list                 show servers
  server <n|name>      select a server
  folder <n>           select a folder on the current server
  open <n|name>        show and follow a file
  up                   back to folders or servers
  refresh              list the current folder again
  stop                 stop following
  download [n|name]    save a file (default: the open one)
  help                 this text
  quit";

#[derive(Debug, PartialEq, Eq)]
enum Input {
    List,
    Server(String),
    Folder(String),
    Open(String),
    Up,
    Refresh,
    Stop,
    Download(Option<String>),
    Help,
    Quit,
    Empty,
    Unknown(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    let (cmd, arg) = match line.split_once(char::is_whitespace) {
        Some((cmd, arg)) => (cmd, Some(arg.trim().to_string())),
        None => (line, None),
    };
    match (cmd, arg) {
        ("", _) => Input::Empty,
        ("list" | "ls", _) => Input::List,
        ("server" | "s", Some(arg)) => Input::Server(arg),
        ("folder" | "f", Some(arg)) => Input::Folder(arg),
        ("open" | "o", Some(arg)) => Input::Open(arg),
        ("up" | "..", _) => Input::Up,
        ("refresh" | "r", _) => Input::Refresh,
        ("stop", _) => Input::Stop,
        ("download" | "d", arg) => Input::Download(arg),
        ("help" | "?", _) => Input::Help,
        ("quit" | "exit" | "q", _) => Input::Quit,
        _ => Input::Unknown(line.to_string()),
    }
}

/// Last listings shown, so numbers typed by the user can be resolved.
#[derive(Default)]
struct View {
    folders: Vec<LogFolder>,
    files: Vec<FileEntry>,
    open_file: Option<String>,
}

impl View {
    fn resolve_file(&self, arg: &str) -> Option<String> {
        if let Ok(n) = arg.parse::<usize>() {
            return self
                .files
                .get(n.checked_sub(1)?)
                .map(|f| f.name.clone());
        }
        Some(arg.to_string())
    }
}

fn resolve_index(arg: &str, names: &[String]) -> Option<usize> {
    if let Ok(n) = arg.parse::<usize>() {
        return n.checked_sub(1).filter(|i| *i < names.len());
    }
    names.iter().position(|n| n.eq_ignore_ascii_case(arg))
}

/// What the input thread should read next.
#[derive(Debug, PartialEq, Eq)]
enum ReadRequest {
    Line,
    /// Read with echo disabled, after printing the prompt.
    Password(String),
}

enum ReadReply {
    Line(String),
    Password(Option<Zeroizing<String>>),
    Closed,
}

/// Owns the terminal's input. It reads only when asked, so a password prompt
/// never races a pending command read.
fn spawn_reader() -> Result<(
    mpsc::UnboundedSender<ReadRequest>,
    mpsc::UnboundedReceiver<ReadReply>,
)> {
    let (request_tx, mut requests) = mpsc::unbounded_channel();
    let (replies, reply_rx) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("logmon-input".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            while let Some(request) = requests.blocking_recv() {
                let reply = match request {
                    ReadRequest::Line => {
                        let mut line = String::new();
                        match stdin.lock().read_line(&mut line) {
                            Ok(0) => ReadReply::Closed,
                            Ok(_) => ReadReply::Line(line),
                            Err(err) => {
                                warn!(error = %err, "reading stdin failed");
                                ReadReply::Closed
                            }
                        }
                    }
                    ReadRequest::Password(prompt) => ReadReply::Password(read_password(&prompt)),
                };
                if replies.send(reply).is_err() {
                    break;
                }
            }
        })?;
    Ok((request_tx, reply_rx))
}

fn read_password(prompt: &str) -> Option<Zeroizing<String>> {
    match rpassword::prompt_password(prompt) {
        Ok(password) if !password.is_empty() => Some(Zeroizing::new(password)),
        Ok(_) => None,
        Err(err) => {
            warn!(error = %err, "reading password failed");
            None
        }
    }
}

/// Sudo prompt bookkeeping between the update stream and the input thread.
#[derive(Debug, Default)]
struct SudoPrompt {
    asked: Option<String>,
    // A command read was already in progress when the prompt arrived; the
    // next line only acknowledges the prompt.
    awaiting_enter: bool,
}

impl SudoPrompt {
    /// Returns a notice to print when the password cannot be read right away.
    fn ask(&mut self, server: &str, retry: bool, reading: bool) -> Option<String> {
        self.asked = Some(if retry {
            format!("sudo password for {server} was rejected, try again: ")
        } else {
            format!("sudo password for {server}: ")
        });
        self.awaiting_enter = reading;
        reading.then(|| format!("sudo password needed for {server}, press Enter to type it"))
    }

    /// True when `line` was consumed as the acknowledgement.
    fn swallow_line(&mut self) -> bool {
        std::mem::take(&mut self.awaiting_enter)
    }

    fn next_request(&self) -> ReadRequest {
        match &self.asked {
            Some(prompt) if !self.awaiting_enter => ReadRequest::Password(prompt.clone()),
            _ => ReadRequest::Line,
        }
    }

    fn answered(&mut self) {
        self.asked = None;
    }
}

struct Console {
    coordinator: Coordinator,
    view: View,
    download_dir: PathBuf,
    sudo: SudoPrompt,
}

pub async fn run(
    coordinator: Coordinator,
    mut updates: UpdateReceiver,
    download_dir: PathBuf,
) -> Result<()> {
    let (requests, mut replies) = spawn_reader()?;
    let mut console = Console {
        coordinator,
        view: View::default(),
        download_dir,
        sudo: SudoPrompt::default(),
    };
    print_servers(&console.coordinator);
    println!("type `help` for commands");

    let mut reading = false;
    loop {
        if !reading {
            if requests.send(console.sudo.next_request()).is_err() {
                break;
            }
            reading = true;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            reply = replies.recv() => {
                reading = false;
                match reply {
                    Some(ReadReply::Line(line)) => {
                        if console.sudo.swallow_line() {
                            continue;
                        }
                        if !console.handle_input(parse_input(&line)) {
                            break;
                        }
                        // Prompts raised by the command are answered before the next read.
                        while let Ok(update) = updates.try_recv() {
                            console.render(update, false);
                        }
                    }
                    Some(ReadReply::Password(password)) => {
                        console.sudo.answered();
                        if let Err(err) = console.coordinator.provide_sudo_password(password) {
                            println!("error: {err}");
                        }
                    }
                    Some(ReadReply::Closed) | None => break,
                }
            }
            Some(update) = updates.recv() => console.render(update, reading),
        }
    }

    console.coordinator.shutdown().await;
    Ok(())
}

impl Console {
    /// Returns false when the user asked to quit.
    fn handle_input(&mut self, input: Input) -> bool {
        let coordinator = &self.coordinator;
        let view = &mut self.view;
        let download_dir = self.download_dir.as_path();
        let result = match input {
            Input::Empty => Ok(()),
            Input::Quit => return false,
            Input::Help => {
                println!("{HELP}");
                Ok(())
            }
            Input::List => {
                print_servers(coordinator);
                Ok(())
            }
            Input::Server(arg) => {
                let names: Vec<String> = coordinator
                    .servers()
                    .iter()
                    .map(|s| s.name.clone())
                    .collect();
                match resolve_index(&arg, &names) {
                    Some(index) => coordinator.select_server(index),
                    None => {
                        println!("no server {arg}");
                        Ok(())
                    }
                }
            }
            Input::Folder(arg) => {
                let names: Vec<String> = view.folders.iter().map(|f| f.name.clone()).collect();
                match resolve_index(&arg, &names) {
                    Some(index) => coordinator.select_folder(index),
                    None => {
                        println!("no folder {arg}");
                        Ok(())
                    }
                }
            }
            Input::Open(arg) => match view.resolve_file(&arg) {
                Some(name) => coordinator.select_file(&name),
                None => {
                    println!("no file {arg}");
                    Ok(())
                }
            },
            Input::Up => {
                coordinator.up_directory();
                Ok(())
            }
            Input::Refresh => coordinator.refresh(),
            Input::Stop => {
                coordinator.stop_tail();
                Ok(())
            }
            Input::Download(arg) => {
                let name = match arg {
                    Some(arg) => view.resolve_file(&arg),
                    None => view.open_file.clone(),
                };
                match name {
                    Some(name) => coordinator.download(download_dir, &name),
                    None => {
                        println!("nothing to download");
                        Ok(())
                    }
                }
            }
            Input::Unknown(line) => {
                println!("unknown command: {line} (try `help`)");
                Ok(())
            }
        };
        if let Err(err) = result {
            println!("error: {err}");
        }
        true
    }

    fn render(&mut self, update: Update, reading: bool) {
        let coordinator = &self.coordinator;
        let view = &mut self.view;
        match update {
            Update::Folders { server, folders } => {
                println!("{server}:");
                for (i, folder) in folders.iter().enumerate() {
                    println!("  {:>3}  {:<20} {}", i + 1, folder.name, folder.path);
                }
                view.folders = folders;
                view.files.clear();
            }
            Update::Connecting { server, folder } => println!("connecting to {server} ({folder})..."),
            Update::Files {
                server,
                folder,
                files,
            } => {
                println!("{server}:{folder}");
                for (i, file) in files.iter().enumerate() {
                    let modified = file
                        .modified
                        .map(|m| m.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_default();
                    let marker = if file.is_dir { "/" } else { "" };
                    println!(
                        "  {:>3}  {:>7}  {:<19}  {}{marker}",
                        i + 1,
                        format_size(file.size),
                        modified,
                        file.name
                    );
                }
                view.files = files;
            }
            Update::SudoPrompt { server, retry } => {
                if let Some(notice) = self.sudo.ask(&server, retry, reading) {
                    println!("{notice}");
                }
            }
            Update::FileContent { file, content } => {
                println!("==> {file} <==");
                print!("{content}");
                view.open_file = Some(file);
            }
            Update::TailData { data, .. } => {
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(&data);
                let _ = out.flush();
            }
            Update::TailEnded { file, message } => println!("[{file}] {message}"),
            Update::Status(text) => println!("-- {text}"),
            Update::Focus(Pane::Servers) => print_servers(coordinator),
            Update::Focus(pane) => debug!(?pane, "focus change"),
            Update::Error { message, focus } => {
                println!("error: {message}");
                if focus == Pane::Servers {
                    print_servers(coordinator);
                }
            }
        }
    }
}

fn print_servers(coordinator: &Coordinator) {
    println!("servers:");
    for (i, server) in coordinator.servers().iter().enumerate() {
        let sudo = if server.sudo { " [sudo]" } else { "" };
        println!(
            "  {:>3}  {:<20} {}@{}:{}{sudo}",
            i + 1,
            server.name,
            server.user,
            server.host,
            server.port
        );
    }
}
