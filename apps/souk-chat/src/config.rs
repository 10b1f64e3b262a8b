use std::env;
use std::str::FromStr;
use std::time::Duration;

use chat_core::{MachineConfig, UserId};

use crate::environment::DEFAULT_NO_STREAM_HOSTS;
use crate::error::{ChatError, ChatResult};
use crate::manager::ManagerConfig;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_PAGE_LIMIT: u32 = 50;
/// The list endpoint caps `limit` at this value.
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Client configuration, resolved from `SOUK_*` environment variables and
/// then overridden by command line flags.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub conversation_id: Option<i64>,
    pub user_id: UserId,
    pub auth: SessionAuth,
    pub force_polling: bool,
    pub no_stream_hosts: Vec<String>,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub poll_interval: Duration,
    pub typing_quiet_period: Duration,
    pub page_limit: u32,
}

/// Django session credentials presented on both transports.
#[derive(Clone, Default)]
pub struct SessionAuth {
    pub session_cookie: Option<String>,
    pub csrf_token: Option<String>,
}

impl SessionAuth {
    /// `Cookie` header value carrying the session and CSRF cookies.
    pub fn cookie_header(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(session) = &self.session_cookie {
            parts.push(format!("sessionid={session}"));
        }
        if let Some(csrf) = &self.csrf_token {
            parts.push(format!("csrftoken={csrf}"));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }
}

impl std::fmt::Debug for SessionAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAuth")
            .field("session_cookie", &self.session_cookie.as_ref().map(|_| "<redacted>"))
            .field("csrf_token", &self.csrf_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        let machine = MachineConfig::default();
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            conversation_id: None,
            user_id: 0,
            auth: SessionAuth::default(),
            force_polling: false,
            no_stream_hosts: DEFAULT_NO_STREAM_HOSTS
                .iter()
                .map(|host| host.to_string())
                .collect(),
            max_reconnect_attempts: machine.max_reconnect_attempts,
            reconnect_delay: machine.reconnect_delay,
            connect_timeout: machine.connect_timeout,
            keepalive_interval: machine.keepalive_interval,
            poll_interval: machine.poll_interval,
            typing_quiet_period: Duration::from_millis(3000),
            page_limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> ChatResult<Self> {
        let mut config = Self::default();

        if let Ok(base) = env::var("SOUK_BASE_URL") {
            config.base_url = base;
        }
        config.conversation_id = parse_var("SOUK_CONVERSATION_ID")?;
        if let Some(user) = parse_var("SOUK_USER_ID")? {
            config.user_id = user;
        }
        config.auth.session_cookie = non_empty_var("SOUK_SESSION_COOKIE");
        config.auth.csrf_token = non_empty_var("SOUK_CSRF_TOKEN");
        if let Some(force) = env_truthy("SOUK_FORCE_POLLING") {
            config.force_polling = force;
        }
        if let Ok(hosts) = env::var("SOUK_NO_STREAM_HOSTS") {
            config.no_stream_hosts = split_hosts(&hosts);
        }
        if let Some(max) = parse_var("SOUK_MAX_RECONNECTS")? {
            config.max_reconnect_attempts = max;
        }
        if let Some(ms) = parse_var("SOUK_RECONNECT_DELAY_MS")? {
            config.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var("SOUK_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var("SOUK_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var("SOUK_TYPING_QUIET_MS")? {
            config.typing_quiet_period = Duration::from_millis(ms);
        }
        if let Some(limit) = parse_var("SOUK_PAGE_LIMIT")? {
            config.page_limit = limit;
        }
        config.page_limit = config.page_limit.clamp(1, MAX_PAGE_LIMIT);
        config.validate()?;
        Ok(config)
    }

    /// Rejects timings the session cannot run with; a zero period would
    /// stall its timers.
    pub fn validate(&self) -> ChatResult<()> {
        let durations = [
            ("poll interval", self.poll_interval),
            ("reconnect delay", self.reconnect_delay),
            ("connect timeout", self.connect_timeout),
            ("keep-alive interval", self.keepalive_interval),
            ("typing quiet period", self.typing_quiet_period),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ChatError::Config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }

    pub fn require_conversation(&self) -> ChatResult<i64> {
        self.conversation_id.ok_or_else(|| {
            ChatError::Config("a conversation id is required (SOUK_CONVERSATION_ID)".into())
        })
    }

    pub fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            max_reconnect_attempts: self.max_reconnect_attempts,
            connect_timeout: self.connect_timeout,
            reconnect_delay: self.reconnect_delay,
            keepalive_interval: self.keepalive_interval,
            poll_interval: self.poll_interval,
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            machine: self.machine_config(),
            typing_quiet_period: self.typing_quiet_period,
            page_limit: self.page_limit.clamp(1, MAX_PAGE_LIMIT),
            current_user_id: self.user_id,
        }
    }
}

/// Serializes tests that mutate process environment variables.
#[cfg(test)]
pub(crate) static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

pub(crate) fn env_truthy(var: &str) -> Option<bool> {
    env::var(var)
        .map(|value| {
            let value = value.trim().to_ascii_lowercase();
            !(value.is_empty() || value == "0" || value == "false" || value == "no")
        })
        .ok()
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var).ok().filter(|value| !value.trim().is_empty())
}

fn parse_var<T>(var: &str) -> ChatResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty_var(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|err| ChatError::Config(format!("{var}={raw:?}: {err}"))),
    }
}

pub fn split_hosts(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|host| host.trim().to_ascii_lowercase())
        .filter(|host| !host.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: &[&str] = &[
        "SOUK_BASE_URL",
        "SOUK_CONVERSATION_ID",
        "SOUK_USER_ID",
        "SOUK_SESSION_COOKIE",
        "SOUK_CSRF_TOKEN",
        "SOUK_FORCE_POLLING",
        "SOUK_NO_STREAM_HOSTS",
        "SOUK_MAX_RECONNECTS",
        "SOUK_RECONNECT_DELAY_MS",
        "SOUK_CONNECT_TIMEOUT_MS",
        "SOUK_POLL_INTERVAL_MS",
        "SOUK_TYPING_QUIET_MS",
        "SOUK_PAGE_LIMIT",
    ];

    fn clear_env() {
        for var in VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn defaults_match_server_contract() {
        let config = ClientConfig::default();
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_delay, Duration::from_millis(3000));
        assert_eq!(config.typing_quiet_period, Duration::from_millis(3000));
        assert_eq!(config.page_limit, 50);
        assert!(config.no_stream_hosts.iter().any(|h| h == "pythonanywhere.com"));
    }

    #[test]
    fn from_env_without_vars_uses_defaults() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clear_env();
        let config = ClientConfig::from_env().unwrap();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.conversation_id, None);
        assert!(config.auth.cookie_header().is_none());
        assert!(config.require_conversation().is_err());
    }

    #[test]
    fn from_env_reads_overrides() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clear_env();
        unsafe {
            env::set_var("SOUK_BASE_URL", "https://souk.example.com");
            env::set_var("SOUK_CONVERSATION_ID", "12");
            env::set_var("SOUK_USER_ID", "7");
            env::set_var("SOUK_SESSION_COOKIE", "abc");
            env::set_var("SOUK_CSRF_TOKEN", "tok");
            env::set_var("SOUK_FORCE_POLLING", "true");
            env::set_var("SOUK_NO_STREAM_HOSTS", " Example.org, ,foo.net");
            env::set_var("SOUK_MAX_RECONNECTS", "2");
            env::set_var("SOUK_POLL_INTERVAL_MS", "750");
            env::set_var("SOUK_PAGE_LIMIT", "500");
        }
        let config = ClientConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.base_url, "https://souk.example.com");
        assert_eq!(config.require_conversation().unwrap(), 12);
        assert_eq!(config.user_id, 7);
        assert!(config.force_polling);
        assert_eq!(config.no_stream_hosts, vec!["example.org", "foo.net"]);
        assert_eq!(config.max_reconnect_attempts, 2);
        assert_eq!(config.poll_interval, Duration::from_millis(750));
        assert_eq!(config.page_limit, MAX_PAGE_LIMIT);
        assert_eq!(
            config.auth.cookie_header().as_deref(),
            Some("sessionid=abc; csrftoken=tok")
        );
        let manager = config.manager_config();
        assert_eq!(manager.machine.max_reconnect_attempts, 2);
        assert_eq!(manager.current_user_id, 7);
    }

    #[test]
    fn malformed_number_is_a_config_error() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clear_env();
        unsafe {
            env::set_var("SOUK_MAX_RECONNECTS", "lots");
        }
        let result = ClientConfig::from_env();
        clear_env();
        assert!(matches!(result, Err(ChatError::Config(message)) if message.contains("SOUK_MAX_RECONNECTS")));
    }

    #[test]
    fn zero_durations_are_config_errors() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for (var, name) in [
            ("SOUK_POLL_INTERVAL_MS", "poll interval"),
            ("SOUK_RECONNECT_DELAY_MS", "reconnect delay"),
            ("SOUK_CONNECT_TIMEOUT_MS", "connect timeout"),
        ] {
            clear_env();
            unsafe {
                env::set_var(var, "0");
            }
            let result = ClientConfig::from_env();
            clear_env();
            assert!(
                matches!(&result, Err(ChatError::Config(message)) if message.contains(name)),
                "{var}=0 gave {result:?}"
            );
        }

        let config = ClientConfig {
            keepalive_interval: Duration::ZERO,
            ..ClientConfig::default()
        };
        assert!(matches!(config.validate(), Err(ChatError::Config(message)) if message.contains("keep-alive")));
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn debug_output_redacts_credentials() {
        let auth = SessionAuth {
            session_cookie: Some("secret-session".into()),
            csrf_token: Some("secret-csrf".into()),
        };
        let rendered = format!("{auth:?}");
        assert!(!rendered.contains("secret"));
    }
}
