pub mod agent;
pub mod api;
pub mod cache;
pub mod cli;
pub mod error;
pub mod flow;
pub mod models;
pub mod poller;
pub mod state;

use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use agent::AgentClient;
use api::ApiClient;
use cache::LocalCache;
use cli::Args;
use error::{ClientError, Result};
use flow::{ChatFlow, StopFlag};
use models::chat::{Conversation, Message, Role};
use poller::UnreadPoller;
use state::{ChatStore, StateEvent};

pub async fn run(args: Args) -> Result<()> {
    info!("--- Core Configuration ---");
    info!("API Host: {}", args.api_host);
    info!("User Email: {}", args.user_email);
    info!("Agent Id: {}", args.agent_id);
    info!("Stream Delay: {}ms", args.stream_delay_ms);
    info!("Reconcile Delay: {}ms", args.reconcile_delay_ms);
    info!("Poll Interval: {}s", args.poll_interval_secs);
    info!("Cache Dir: {}", args.cache_dir);
    info!("-------------------------");

    let api = ApiClient::new(&args.api_host)?;
    let agent = AgentClient::new(&args.agent_token)?;
    let cache = LocalCache::open(Path::new(&args.cache_dir))?;

    let user = api.get_user_by_email(&args.user_email).await?;
    let user_id = user.id.ok_or_else(|| {
        ClientError::Config(format!("User '{}' has no id", args.user_email))
    })?;
    info!("Acting as user {} ({})", user_id, args.user_email);

    let store = Arc::new(ChatStore::new());
    let flow = Arc::new(ChatFlow::new(
        api.clone(),
        agent,
        cache.clone(),
        Arc::clone(&store),
        user_id,
        args.agent_id,
        Duration::from_millis(args.stream_delay_ms),
        Duration::from_millis(args.reconcile_delay_ms),
    ));

    flow.load_user_data().await?;
    restore_selection(&flow, &cache, &store).await?;

    let printer = spawn_event_printer(Arc::clone(&store));
    let poller = UnreadPoller::new(
        api,
        cache,
        Arc::clone(&store),
        user_id,
        Duration::from_secs(args.poll_interval_secs),
    )
    .spawn();

    repl(&flow, &store).await;

    poller.abort();
    printer.abort();
    Ok(())
}

/// Resume the cached conversation if it still exists on the backend,
/// otherwise fall back to the most recent one, or create a fresh one.
async fn restore_selection(
    flow: &Arc<ChatFlow>,
    cache: &LocalCache,
    store: &Arc<ChatStore>,
) -> Result<()> {
    let conversations = store.snapshot().await.conversations;

    match cache.load_selected_conversation() {
        Ok(Some(cached)) if cached.id.is_some() => {
            if conversations.iter().any(|c| c.id == cached.id) {
                match flow.select_conversation(cached).await {
                    Ok(()) => return Ok(()),
                    Err(e) => warn!("Failed to resume cached conversation: {}", e),
                }
            }
        }
        Ok(_) => {}
        Err(e) => warn!("Failed to read cached selection: {}", e),
    }

    if let Some(first) = conversations.first().cloned() {
        flow.select_conversation(first).await?;
    } else {
        flow.new_conversation().await?;
    }
    Ok(())
}

/// Render store events to the terminal: streamed chunks as they arrive,
/// merged out-of-band messages, and surfaced errors.
fn spawn_event_printer(store: Arc<ChatStore>) -> JoinHandle<()> {
    let mut events = store.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(StateEvent::AssistantDelta { delta, .. }) => {
                    print!("{}", delta);
                    let _ = std::io::stdout().flush();
                }
                Ok(StateEvent::StreamEnded { cancelled, .. }) => {
                    if cancelled {
                        println!("\n[stopped]");
                    } else {
                        println!();
                    }
                }
                Ok(StateEvent::UnreadMerged { count, .. }) => {
                    println!("[{} message(s) arrived out-of-band]", count);
                }
                Ok(StateEvent::Error { message }) => {
                    error!("{}", message);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event renderer lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn repl(flow: &Arc<ChatFlow>, store: &Arc<ChatStore>) {
    println!("Commands: /new, /list, /open <n>, /rename <name>, /delete <n>, /quit");
    println!("Anything else is sent to the agent. Ctrl-C stops an active reply.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        if let Some(conversation) = store.selected_conversation().await {
            print!("[{}] > ", conversation.name);
        } else {
            print!("> ");
        }
        let _ = std::io::stdout().flush();

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read input: {}", e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line.split_once(' ') {
            _ if line == "/quit" || line == "/exit" => break,
            _ if line == "/new" => {
                let _ = flow.new_conversation().await;
            }
            _ if line == "/list" => {
                print_conversations(store).await;
            }
            Some(("/open", index)) => {
                if let Some(conversation) = conversation_at(store, index).await {
                    if flow.select_conversation(conversation).await.is_ok() {
                        print_transcript(store).await;
                    }
                }
            }
            Some(("/rename", name)) => {
                if let Some(mut conversation) = store.selected_conversation().await {
                    conversation.name = name.to_string();
                    let _ = flow.update_conversation(conversation).await;
                }
            }
            Some(("/delete", index)) => {
                if let Some(id) = conversation_at(store, index).await.and_then(|c| c.id) {
                    let _ = flow.delete_conversation(id).await;
                }
            }
            _ if line.starts_with('/') => {
                println!("Unknown command: {}", line);
            }
            _ => {
                send_with_stop(flow, store, line).await;
            }
        }
    }
}

/// Drive one send while listening for Ctrl-C; the signal raises the stop
/// flag, letting the in-flight stream wind down cleanly.
async fn send_with_stop(flow: &Arc<ChatFlow>, store: &Arc<ChatStore>, content: &str) {
    if store.is_streaming().await {
        println!("A reply is already streaming; wait for it to finish.");
        return;
    }
    let stop = StopFlag::new();
    let send = flow.send_message(Message::user(content), 0, &stop);
    tokio::pin!(send);
    loop {
        tokio::select! {
            result = &mut send => {
                if let Err(e) = result {
                    error!("Send failed: {}", e);
                }
                break;
            }
            signal = tokio::signal::ctrl_c() => {
                if signal.is_ok() {
                    info!("Stop requested");
                    stop.stop();
                }
            }
        }
    }
}

async fn print_conversations(store: &Arc<ChatStore>) {
    let state = store.snapshot().await;
    let selected_id = state.selected_conversation.as_ref().and_then(|c| c.id);
    if state.conversations.is_empty() {
        println!("No conversations yet. /new creates one.");
        return;
    }
    for (index, conversation) in state.conversations.iter().enumerate() {
        let marker = if conversation.id.is_some() && conversation.id == selected_id {
            "*"
        } else {
            " "
        };
        println!("{} {:>3}  {}", marker, index, conversation.name);
    }
}

async fn print_transcript(store: &Arc<ChatStore>) {
    let Some(conversation) = store.selected_conversation().await else {
        return;
    };
    for message in &conversation.messages {
        println!("{}: {}", role_label(&message.role), message.content);
    }
}

async fn conversation_at(store: &Arc<ChatStore>, index: &str) -> Option<Conversation> {
    let index: usize = match index.trim().parse() {
        Ok(index) => index,
        Err(_) => {
            println!("Expected a conversation number, got '{}'", index);
            return None;
        }
    };
    let conversation = store.snapshot().await.conversations.get(index).cloned();
    if conversation.is_none() {
        println!("No conversation at {}", index);
    }
    conversation
}

fn role_label(role: &Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Assistant => "agent",
    }
}
