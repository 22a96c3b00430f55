//! Bridge between stdin lines, the sync runtime and rendered stdout output.

use std::{
    error::Error,
    fmt,
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use sync_core::{
    ConnectionState, DeliveryState, Message, MessageContent, Origin, OutgoingImage, StoreSnapshot,
    SyncEvent,
};
use sync_socket::SyncHandle;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

const RENDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const HELP: &str = "commands: /open <thread>, /close, /refresh, /image <path>, /quit; \
                    any other line is sent to the open thread (start with // to send a leading slash)";

/// One parsed line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Open(String),
    Close,
    Refresh,
    Image(PathBuf),
    Quit,
    Help,
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    MissingArgument { command: &'static str },
    UnknownCommand(String),
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingArgument { command } => write!(f, "{command} needs an argument"),
            Self::UnknownCommand(command) => write!(f, "unknown command '{command}'"),
        }
    }
}

impl Error for InputError {}

/// Parse a stdin line. Blank lines yield `None`.
pub fn parse_input(line: &str) -> Result<Option<ConsoleInput>, InputError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if let Some(escaped) = line.strip_prefix("//") {
        return Ok(Some(ConsoleInput::Text(format!("/{escaped}"))));
    }
    if !line.starts_with('/') {
        return Ok(Some(ConsoleInput::Text(line.to_owned())));
    }

    let (command, argument) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };
    let input = match command {
        "/open" => ConsoleInput::Open(required(argument, "/open")?.to_owned()),
        "/image" => ConsoleInput::Image(PathBuf::from(required(argument, "/image")?)),
        "/close" => ConsoleInput::Close,
        "/refresh" => ConsoleInput::Refresh,
        "/quit" | "/exit" => ConsoleInput::Quit,
        "/help" => ConsoleInput::Help,
        other => return Err(InputError::UnknownCommand(other.to_owned())),
    };
    Ok(Some(input))
}

fn required<'a>(argument: &'a str, command: &'static str) -> Result<&'a str, InputError> {
    if argument.is_empty() {
        Err(InputError::MissingArgument { command })
    } else {
        Ok(argument)
    }
}

/// MIME type guessed from the file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

async fn load_image(path: &Path) -> io::Result<OutgoingImage> {
    let data = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("image")
        .to_owned();
    Ok(OutgoingImage {
        file_name,
        content_type: content_type_for(path).to_owned(),
        data,
    })
}

/// Render a store snapshot as plain text.
pub fn render_snapshot(snapshot: &StoreSnapshot) -> String {
    let mut out = format!("== conversations (rev {}) ==\n", snapshot.revision);
    for conversation in &snapshot.conversations {
        let marker = if snapshot.open_thread_id.as_deref() == Some(conversation.thread_id.as_str()) {
            '*'
        } else {
            ' '
        };
        out.push_str(&format!(
            "{marker} {} [{}]",
            conversation.display_name, conversation.thread_id
        ));
        if let Some(preview) = &conversation.last_message_preview {
            out.push_str(&format!("  {preview}"));
        }
        out.push('\n');
    }

    if let Some(thread_id) = &snapshot.open_thread_id {
        out.push_str(&format!("== {thread_id} ==\n"));
        for message in &snapshot.messages {
            out.push_str(&render_message(message));
            out.push('\n');
        }
    }
    out
}

fn render_message(message: &Message) -> String {
    let body = match &message.content {
        MessageContent::Text { body } => body.clone(),
        MessageContent::Image { url, file_name } => {
            match file_name.as_deref().or(url.as_deref()) {
                Some(name) => format!("[image] {name}"),
                None => "[image]".to_owned(),
            }
        }
        MessageContent::Notice { text } => text.clone(),
    };
    let line = match message.origin {
        Origin::Own => format!("  you: {body}"),
        Origin::Peer => format!(
            "  {}: {body}",
            message.sender_name.as_deref().unwrap_or("them")
        ),
        Origin::System => format!("  ! {body}"),
    };
    match message.delivery {
        DeliveryState::Pending => format!("{line} (sending)"),
        DeliveryState::Failed => format!("{line} (failed)"),
        DeliveryState::Confirmed => line,
    }
}

/// Status line for non-snapshot events.
pub fn render_event(event: &SyncEvent) -> Option<String> {
    match event {
        SyncEvent::StoreChanged(_) => None,
        SyncEvent::ConnectionChanged(state) => Some(match state {
            ConnectionState::Idle => "-- live sync idle".to_owned(),
            ConnectionState::Connecting => "-- connecting".to_owned(),
            ConnectionState::Open => "-- live sync connected".to_owned(),
            ConnectionState::Closed { normal: true } => "-- live sync closed".to_owned(),
            ConnectionState::Closed { normal: false } => "-- live sync lost".to_owned(),
        }),
        SyncEvent::SendAck(ack) => ack
            .error_code
            .as_ref()
            .map(|code| format!("-- send to {} failed ({code})", ack.thread_id)),
        SyncEvent::ConnectionAbandoned { attempts } => Some(format!(
            "-- live sync stopped after {attempts} reconnect attempts"
        )),
        SyncEvent::Error {
            code,
            message,
            retry_after_ms: None,
        } => Some(format!("-- error {code}: {message}")),
        SyncEvent::Error {
            code,
            message,
            retry_after_ms: Some(ms),
        } => Some(format!("-- error {code}: {message} (retry in {}s)", ms.div_ceil(1_000))),
    }
}

fn spawn_renderer(handle: &SyncHandle) -> JoinHandle<()> {
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SyncEvent::StoreChanged(snapshot)) => print!("{}", render_snapshot(&snapshot)),
                Ok(event) => {
                    if let Some(line) = render_event(&event) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "renderer lagged; next snapshot catches up");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Drive the runtime from stdin until `/quit` or end of input.
pub async fn run(handle: SyncHandle) -> io::Result<()> {
    let renderer = spawn_renderer(&handle);
    if let Err(err) = handle.start().await {
        warn!(code = %err.code, error = %err, "start failed");
    }

    let mut open_thread: Option<String> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = match parse_input(&line) {
            Ok(Some(input)) => input,
            Ok(None) => continue,
            Err(err) => {
                println!("{err}; {HELP}");
                continue;
            }
        };

        let result = match input {
            ConsoleInput::Quit => break,
            ConsoleInput::Help => {
                println!("{HELP}");
                Ok(())
            }
            ConsoleInput::Open(thread_id) => {
                open_thread = Some(thread_id.clone());
                handle.open_thread(thread_id).await
            }
            ConsoleInput::Close => {
                open_thread = None;
                handle.close_thread().await
            }
            ConsoleInput::Refresh => handle.refresh_conversations().await,
            ConsoleInput::Text(text) => match &open_thread {
                Some(thread_id) => handle.send_text(thread_id.clone(), text).await,
                None => {
                    println!("open a thread first with /open <thread>");
                    Ok(())
                }
            },
            ConsoleInput::Image(path) => match &open_thread {
                Some(thread_id) => match load_image(&path).await {
                    Ok(image) => handle.send_image(thread_id.clone(), image).await,
                    Err(err) => {
                        println!("cannot read {}: {err}", path.display());
                        Ok(())
                    }
                },
                None => {
                    println!("open a thread first with /open <thread>");
                    Ok(())
                }
            },
        };
        if let Err(err) = result {
            warn!(code = %err.code, error = %err, "command rejected");
            println!("-- {}", err.message);
        }
    }

    info!("shutting down session");
    if let Err(err) = handle.teardown().await {
        debug!(error = %err, "runtime already stopped");
    }
    drop(handle);
    if tokio::time::timeout(RENDER_DRAIN_TIMEOUT, renderer).await.is_err() {
        debug!("renderer did not drain in time");
    }
    Ok(())
}
