use std::{collections::HashMap, path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use chat_core::{
    config::load_settings_from, ChatClient, ClientEvent, ClientHandle, Message, MediaUpload,
};
use chat_shared::domain::{
    ConversationId, ConversationKind, DeliveryState, MessageKey, TempId, UserId,
};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = chat_core::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    token: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the conversation list.
    List,
    Create {
        #[arg(long)]
        group: bool,
        #[arg(long)]
        name: Option<String>,
        participants: Vec<String>,
    },
    Delete {
        conversation_id: String,
    },
    /// Interactive session on one conversation.
    Open {
        conversation_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings_from(&cli.config, |key| std::env::var(key).ok());
    if let Some(api_url) = cli.api_url {
        settings.api_url = api_url;
    }
    if cli.token.is_some() {
        settings.auth_token = cli.token;
    }
    let me = UserId::parse(&cli.user_id)?;
    let client = ChatClient::connect_http(settings, me)?;

    match cli.command {
        Command::List => {
            client.refresh_conversations().await?;
            for conversation in client.conversations().await {
                println!(
                    "{}  {}  unread={}  {}",
                    conversation.id,
                    conversation.display_name(me),
                    conversation.unread_count,
                    conversation
                        .last_message
                        .as_ref()
                        .map(|last| last.content.as_str())
                        .unwrap_or("")
                );
            }
        }
        Command::Create {
            group,
            name,
            participants,
        } => {
            let participant_ids = participants
                .iter()
                .map(|raw| UserId::parse(raw))
                .collect::<Result<Vec<_>, _>>()?;
            let kind = if group {
                ConversationKind::Group
            } else {
                ConversationKind::Direct
            };
            let conversation_id = client
                .create_conversation(kind, name, participant_ids)
                .await?;
            println!("created conversation_id={conversation_id}");
        }
        Command::Delete { conversation_id } => {
            let conversation_id = ConversationId::parse(&conversation_id)?;
            client.delete_conversation(conversation_id).await?;
            println!("deleted conversation_id={conversation_id}");
        }
        Command::Open { conversation_id } => {
            let conversation_id = ConversationId::parse(&conversation_id)?;
            run_session(client, conversation_id).await?;
        }
    }

    Ok(())
}

async fn run_session(client: Arc<ChatClient>, conversation_id: ConversationId) -> Result<()> {
    let printer = spawn_printer(&client, conversation_id);
    client.refresh_conversations().await?;
    client.select_conversation(conversation_id).await?;
    println!("commands: /older /retry <temp-id> /edit <id> <text> /unsend <id> /attach <path> [caption] /reconnect /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(err) = run_command(&client, conversation_id, line).await {
            eprintln!("error: {err}");
        }
    }

    client.disconnect_all().await;
    printer.abort();
    Ok(())
}

async fn run_command(
    client: &Arc<ChatClient>,
    conversation_id: ConversationId,
    line: &str,
) -> Result<()> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "/older" => {
            let added = client.load_older(conversation_id).await?;
            println!("loaded {added} older messages");
        }
        "/retry" => {
            let temp_id = TempId::parse(rest.trim())?;
            client.retry(conversation_id, temp_id).await?;
        }
        "/unsend" => {
            let key = MessageKey::classify(rest.trim())?;
            client.unsend(conversation_id, key).await?;
        }
        "/edit" => {
            let (id, content) = rest
                .split_once(' ')
                .ok_or_else(|| anyhow!("usage: /edit <id> <text>"))?;
            let key = MessageKey::classify(id)?;
            client.edit(conversation_id, key, content.to_string()).await?;
        }
        "/attach" => {
            let (path, caption) = rest.split_once(' ').unwrap_or((rest, ""));
            let upload = read_upload(PathBuf::from(path.trim())).await?;
            client
                .send_with_media(conversation_id, caption.to_string(), vec![upload])
                .await?;
        }
        "/reconnect" => client.reconnect(conversation_id).await?,
        _ if command.starts_with('/') => return Err(anyhow!("unknown command {command}")),
        _ => {
            client.send(conversation_id, line.to_string()).await?;
        }
    }
    Ok(())
}

async fn read_upload(path: PathBuf) -> Result<MediaUpload> {
    let bytes = tokio::fs::read(&path).await?;
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("invalid file name {}", path.display()))?
        .to_string();
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    let mime_type = match extension.as_deref() {
        Some("png") => Some("image/png"),
        Some("jpg" | "jpeg") => Some("image/jpeg"),
        Some("gif") => Some("image/gif"),
        Some("mp4") => Some("video/mp4"),
        Some("mp3") => Some("audio/mpeg"),
        Some("ogg") => Some("audio/ogg"),
        _ => None,
    };
    Ok(MediaUpload {
        filename,
        mime_type: mime_type.map(str::to_string),
        bytes,
    })
}

fn spawn_printer(
    client: &Arc<ChatClient>,
    conversation_id: ConversationId,
) -> tokio::task::JoinHandle<()> {
    let mut events = client.subscribe_events();
    let me = client.me();
    tokio::spawn(async move {
        let mut printed: HashMap<MessageKey, (DeliveryState, String)> = HashMap::new();
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "cli: event printer lagged");
                    continue;
                }
                Err(_) => break,
            };
            match event {
                ClientEvent::Updated(update) if update.conversation_id == Some(conversation_id) => {
                    for message in &update.timeline {
                        let state = (message.delivery, message.content.clone());
                        if printed.get(&message.key) != Some(&state) {
                            println!("{}", render(message, me));
                            printed.insert(message.key.clone(), state);
                        }
                    }
                }
                ClientEvent::Updated(_) => {}
                ClientEvent::ChannelStatus {
                    conversation_id: id,
                    status,
                } if id == conversation_id => println!("-- channel {status}"),
                ClientEvent::ChannelStatus { .. } => {}
                ClientEvent::Typing {
                    conversation_id: id,
                    sender_id,
                } if id == conversation_id => println!("-- {sender_id} is typing"),
                ClientEvent::Typing { .. } | ClientEvent::ReadReceipt { .. } => {}
                ClientEvent::SendFailed { temp_id, reason, .. } => {
                    println!("-- send {temp_id} failed: {reason} (use /retry {temp_id})");
                }
                ClientEvent::Error(message) => println!("-- {message}"),
            }
        }
    })
}

fn render(message: &Message, me: UserId) -> String {
    let sender = if message.sender_id == me {
        "me".to_string()
    } else {
        message.sender_id.to_string()
    };
    let state = match message.delivery {
        DeliveryState::Pending => " (sending)",
        DeliveryState::Failed => " (failed)",
        DeliveryState::Deleted => return format!("[{}] {sender}: message unsent", message.key),
        DeliveryState::Confirmed if message.edited => " (edited)",
        DeliveryState::Confirmed => "",
    };
    let attachments = message
        .attachments
        .iter()
        .map(|attachment| format!(" <{}>", attachment.url))
        .collect::<String>();
    format!(
        "[{}] {sender}: {}{attachments}{state}",
        message.key, message.content
    )
}
