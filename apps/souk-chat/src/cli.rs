use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::{ClientConfig, split_hosts};
use crate::error::ChatResult;
use crate::telemetry::logging::{LogConfig, LogLevel};

/// Command line flags. Every connection setting can also come from the
/// matching `SOUK_*` environment variable (or `.env`); flags win.
#[derive(Parser, Debug)]
#[command(
    name = "souk-chat",
    about = "Marketplace chat over a live stream, with HTTP polling when streaming is unavailable",
    author,
    version
)]
pub struct Cli {
    #[arg(long, global = true, help = "Base URL of the marketplace server")]
    pub base_url: Option<String>,

    #[arg(
        long,
        global = true,
        value_name = "COOKIE",
        help = "Value of the Django sessionid cookie"
    )]
    pub session_cookie: Option<String>,

    #[arg(
        long,
        global = true,
        value_name = "TOKEN",
        help = "CSRF token sent as cookie and X-CSRFToken header"
    )]
    pub csrf_token: Option<String>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Join a conversation and chat interactively.
    Chat(ChatArgs),
    /// List active conversations.
    Conversations,
    /// Show unread message counts.
    Unread,
    /// Archive a conversation.
    Archive {
        #[arg(value_name = "CONVERSATION_ID")]
        conversation_id: i64,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct ChatArgs {
    #[arg(long = "conversation", short = 'c', value_name = "ID")]
    pub conversation_id: Option<i64>,

    #[arg(long, value_name = "ID", help = "Id of the signed-in user")]
    pub user_id: Option<i64>,

    #[arg(long, help = "Skip the stream and poll over HTTP from the start")]
    pub force_polling: bool,

    #[arg(
        long,
        value_name = "HOSTS",
        help = "Comma separated host suffixes known to block streaming"
    )]
    pub no_stream_hosts: Option<String>,

    #[arg(long, value_name = "N")]
    pub max_reconnects: Option<u32>,

    #[arg(long, value_name = "MS")]
    pub poll_interval_ms: Option<u64>,

    #[arg(long, value_name = "N", help = "Messages per history page (max 100)")]
    pub page_limit: Option<u32>,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "SOUK_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "SOUK_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

impl Cli {
    /// Layers flags over `config` and checks the result.
    pub fn apply_overrides(&self, config: &mut ClientConfig) -> ChatResult<()> {
        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.clone();
        }
        if let Some(cookie) = &self.session_cookie {
            config.auth.session_cookie = Some(cookie.clone());
        }
        if let Some(token) = &self.csrf_token {
            config.auth.csrf_token = Some(token.clone());
        }
        if let Command::Chat(chat) = &self.command {
            chat.apply_overrides(config);
        }
        config.validate()
    }
}

impl ChatArgs {
    fn apply_overrides(&self, config: &mut ClientConfig) {
        if let Some(id) = self.conversation_id {
            config.conversation_id = Some(id);
        }
        if let Some(id) = self.user_id {
            config.user_id = id;
        }
        if self.force_polling {
            config.force_polling = true;
        }
        if let Some(hosts) = &self.no_stream_hosts {
            config.no_stream_hosts = split_hosts(hosts);
        }
        if let Some(max) = self.max_reconnects {
            config.max_reconnect_attempts = max;
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(limit) = self.page_limit {
            config.page_limit = limit;
        }
    }
}
