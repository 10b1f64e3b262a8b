use anyhow::{Context, Result};
use clap::Parser;
use chat_core::Message;
use souk_chat::cli::{Cli, Command};
use souk_chat::telemetry::logging;
use souk_chat::{
    ApiEndpoints, ChatError, ChatEvent, ChatHandle, ClientConfig, ConnectionManager, HttpClient,
};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use tokio::io::{AsyncBufReadExt, BufReader};

const CLOCK: &[BorrowedFormatItem<'static>] = format_description!("[hour]:[minute]");

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("failed to initialize logging")?;

    let mut config = ClientConfig::from_env()?;
    cli.apply_overrides(&mut config)?;

    match &cli.command {
        Command::Chat(_) => run_chat(config).await,
        Command::Conversations => list_conversations(&config).await,
        Command::Unread => show_unread(&config).await,
        Command::Archive { conversation_id } => {
            http_client(&config)?.archive(*conversation_id).await?;
            println!("conversation {conversation_id} archived");
            Ok(())
        }
    }
}

fn http_client(config: &ClientConfig) -> Result<HttpClient> {
    let endpoints = ApiEndpoints::parse(&config.base_url)?;
    Ok(HttpClient::new(endpoints, &config.auth)?)
}

async fn list_conversations(config: &ClientConfig) -> Result<()> {
    let conversations = http_client(config)?.conversations().await?;
    if conversations.is_empty() {
        println!("no active conversations");
    }
    for conversation in conversations {
        let name = conversation
            .other_user
            .full_name
            .as_deref()
            .unwrap_or(&conversation.other_user.username);
        let listing = conversation
            .property
            .as_ref()
            .map(|property| format!(" [{}]", property.title))
            .unwrap_or_default();
        let preview = conversation
            .last_message
            .as_ref()
            .and_then(|last| last.content.as_deref())
            .unwrap_or("");
        println!(
            "#{:<5} {name}{listing} ({} unread) {preview}",
            conversation.id, conversation.unread_count
        );
    }
    Ok(())
}

async fn show_unread(config: &ClientConfig) -> Result<()> {
    let unread = http_client(config)?.unread().await?;
    println!("{} unread", unread.total_unread);
    let mut by_conversation: Vec<_> = unread.by_conversation.into_iter().collect();
    by_conversation.sort();
    for (conversation, count) in by_conversation {
        println!("  #{conversation}: {count}");
    }
    Ok(())
}

async fn run_chat(config: ClientConfig) -> Result<()> {
    let user_id = config.user_id;
    let manager = ConnectionManager::from_client_config(&config)?;
    let (handle, mut events) = manager.start();

    println!("commands: /older, /read, /typing, /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event, user_id),
                None => break,
            },
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if !handle_line(&handle, line.trim(), user_id).await {
                    break;
                }
            }
        }
    }

    handle.close().await?;
    while let Ok(event) = events.try_recv() {
        print_event(&event, user_id);
    }
    Ok(())
}

/// Returns false when the user asked to quit.
async fn handle_line(handle: &ChatHandle, line: &str, user_id: i64) -> bool {
    let result = match line {
        "" => Ok(()),
        "/quit" | "/exit" => return false,
        "/typing" => handle.notify_input_activity(),
        "/older" => match handle.load_older().await {
            Ok(page) if page.messages.is_empty() && !page.has_more => {
                println!("-- beginning of conversation --");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(ChatError::HistoryExhausted) => {
                println!("-- beginning of conversation --");
                Ok(())
            }
            Err(err) => Err(err),
        },
        "/read" => mark_latest_read(handle, user_id).await,
        text => handle.send_message(text).await,
    };
    if let Err(err) = result {
        eprintln!("! {err}");
    }
    true
}

async fn mark_latest_read(handle: &ChatHandle, user_id: i64) -> Result<(), ChatError> {
    let latest_unread = handle
        .messages()
        .await?
        .into_iter()
        .filter(|message| !message.is_read && !message.is_mine(user_id))
        .map(|message| message.id)
        .max();
    match latest_unread {
        Some(id) => handle.mark_read(id).await,
        None => Ok(()),
    }
}

fn print_event(event: &ChatEvent, user_id: i64) {
    match event {
        ChatEvent::Message(message) => print_message(message, user_id),
        ChatEvent::HistoryLoaded { messages, has_more } => {
            for message in messages {
                print_message(message, user_id);
            }
            if !has_more {
                println!("-- beginning of conversation --");
            }
        }
        ChatEvent::TypingChanged {
            username,
            is_typing: true,
        } => println!("   {username} is typing..."),
        ChatEvent::TypingChanged { .. } => {}
        ChatEvent::ReadReceipt { message_id } => println!("   seen (#{message_id})"),
        ChatEvent::ConnectionStateChanged { text, .. } => println!("** {text}"),
        ChatEvent::Presence { username, joined } => {
            let verb = if *joined { "joined" } else { "left" };
            println!("** {username} {verb}");
        }
        ChatEvent::Error { message } => eprintln!("! {message}"),
    }
}

fn print_message(message: &Message, user_id: i64) {
    let clock = message.timestamp.format(CLOCK).unwrap_or_default();
    let who = if message.is_mine(user_id) {
        "you"
    } else {
        message.display_name()
    };
    let attachment = if message.has_attachment { " [attachment]" } else { "" };
    println!("[{clock}] {who}: {}{attachment}", message.content);
}
