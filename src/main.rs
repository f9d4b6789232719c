use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use inboxchat::config::{load_config, ClientConfig};
use inboxchat::conversation::{ChatMessage, ConversationStore};
use inboxchat::dispatch::CoalescingDispatcher;
use inboxchat::observability::init_tracing;
use inboxchat::protocol::Role;
use inboxchat::session::SessionController;
use inboxchat::transport::HttpChatTransport;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const DEFAULT_CONFIG_PATH: &str = "config.yaml";

fn main() {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = load_config(&path).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration from {path}: {e}");
        eprintln!("Please copy 'config.example.yaml' to 'config.yaml' and modify as needed.");
        std::process::exit(1);
    });

    init_tracing(&config.features);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Failed to initialize Tokio runtime: {e}");
            std::process::exit(1);
        });

    runtime.block_on(run(config));
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Say(String),
    Stop,
    Context(Vec<String>),
    Skip,
}

fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Skip;
    }
    if line == "/stop" {
        return Command::Stop;
    }
    if let Some(rest) = line
        .strip_prefix("/context")
        .filter(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
    {
        let refs = rest
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect();
        return Command::Context(refs);
    }
    Command::Say(line.to_string())
}

async fn run(config: ClientConfig) {
    let transport = HttpChatTransport::from_config(&config.backend).unwrap_or_else(|e| {
        eprintln!("Failed to set up chat backend: {e}");
        std::process::exit(1);
    });
    tracing::info!(url = %transport.url(), "chat backend configured");

    let store = ConversationStore::new();
    let controller = SessionController::new(Arc::new(transport), store.clone(), config.session);
    let dispatcher = CoalescingDispatcher::new(controller, &config.dispatch);
    let printer = tokio::spawn(print_replies(store));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read stdin");
                break;
            }
        };
        match parse_command(&line) {
            Command::Say(text) => {
                dispatcher.submit(text);
            }
            Command::Stop => dispatcher.stop(),
            Command::Context(refs) => {
                tracing::info!(context_refs = refs.len(), "context updated");
                dispatcher.set_context_refs(refs);
            }
            Command::Skip => {}
        }
    }

    dispatcher.wait_idle().await;
    printer.abort();
    println!();
}

/// Echo assistant replies to stdout as they stream in.
async fn print_replies(store: ConversationStore) {
    let mut changes = store.subscribe();
    let mut printed: HashMap<usize, ChatMessage> = HashMap::new();
    let mut stdout = tokio::io::stdout();

    while changes.changed().await.is_ok() {
        let mut out = String::new();
        for (index, message) in store.snapshot().into_iter().enumerate() {
            if message.role != Role::Assistant {
                continue;
            }
            let previous = printed.get(&index);
            if previous == Some(&message) {
                continue;
            }
            if previous.is_none() && !printed.is_empty() {
                out.push('\n');
            }
            render_update(previous, &message, &mut out);
            printed.insert(index, message);
        }
        if out.is_empty() {
            continue;
        }
        if stdout.write_all(out.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            return;
        }
    }
}

fn render_update(previous: Option<&ChatMessage>, message: &ChatMessage, out: &mut String) {
    match previous.and_then(|p| message.content.strip_prefix(p.content.as_str())) {
        Some(suffix) => out.push_str(suffix),
        None => {
            if previous.is_some() {
                out.push('\n');
            }
            out.push_str("assistant> ");
            out.push_str(&message.content);
        }
    }
    let previous_widget = previous.and_then(|p| p.widget.as_ref());
    if let Some(widget) = message.widget.as_ref().filter(|w| Some(*w) != previous_widget) {
        let _ = write!(out, "\n[{} widget] {}\n", widget.widget_type, widget.data);
    }
}
