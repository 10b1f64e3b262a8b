//! Decides, once per session, whether the streaming transport is worth trying.

/// Hosting providers known to reject WebSocket upgrades.
pub const DEFAULT_NO_STREAM_HOSTS: &[&str] = &["pythonanywhere.com"];

pub trait EnvironmentProbe: Send + Sync {
    /// True when the environment is known to block the stream transport.
    fn should_skip_stream(&self) -> bool;
}

impl<F> EnvironmentProbe for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn should_skip_stream(&self) -> bool {
        (self)()
    }
}

/// A fixed answer, used for `--force-polling` and in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticProbe(pub bool);

impl EnvironmentProbe for StaticProbe {
    fn should_skip_stream(&self) -> bool {
        self.0
    }
}

/// Skips the stream when the server host equals or is a subdomain of one
/// of the configured suffixes.
#[derive(Debug, Clone)]
pub struct HostSuffixProbe {
    host: Option<String>,
    suffixes: Vec<String>,
}

impl HostSuffixProbe {
    pub fn new<I, S>(host: Option<&str>, suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            host: host.map(|host| host.trim_end_matches('.').to_ascii_lowercase()),
            suffixes: suffixes
                .into_iter()
                .map(|suffix| {
                    suffix
                        .as_ref()
                        .trim()
                        .trim_start_matches('.')
                        .to_ascii_lowercase()
                })
                .filter(|suffix| !suffix.is_empty())
                .collect(),
        }
    }
}

impl EnvironmentProbe for HostSuffixProbe {
    fn should_skip_stream(&self) -> bool {
        let Some(host) = self.host.as_deref() else {
            return false;
        };
        self.suffixes.iter().any(|suffix| {
            host == suffix
                || host
                    .strip_suffix(suffix.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}
