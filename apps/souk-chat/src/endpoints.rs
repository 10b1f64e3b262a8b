use url::Url;

use crate::error::{ChatError, ChatResult};

/// Server-wide chat API locations derived from one HTTP base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiEndpoints {
    base: Url,
}

impl ApiEndpoints {
    /// Accepts `host[:port]`, `http(s)://...` or `ws(s)://...`.
    ///
    /// Bare hosts get `https://` unless they point at the local machine.
    /// `localhost` is rewritten to `127.0.0.1` so the stream never races an
    /// IPv6 resolution the dev server is not listening on.
    pub fn parse(base_url: &str) -> ChatResult<Self> {
        let raw = base_url.trim();
        if raw.is_empty() {
            return Err(ChatError::Config("base url is empty".into()));
        }
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else if raw.starts_with("localhost") || raw.starts_with("127.0.0.1") {
            format!("http://{raw}")
        } else {
            format!("https://{raw}")
        };

        let mut base = Url::parse(&with_scheme)?;
        let scheme = match base.scheme() {
            "http" | "ws" => "http",
            "https" | "wss" => "https",
            other => {
                return Err(ChatError::Config(format!(
                    "unsupported base url scheme {other:?}"
                )));
            }
        };
        set_scheme(&mut base, scheme)?;

        if base.host_str() == Some("localhost") {
            base.set_host(Some("127.0.0.1"))?;
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.set_query(None);
        base.set_fragment(None);
        Ok(Self { base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn host(&self) -> Option<&str> {
        self.base.host_str()
    }

    /// `scheme://host[:port]`, sent as the `Origin`/`Referer` for CSRF checks.
    pub fn origin(&self) -> String {
        self.base.origin().ascii_serialization()
    }

    pub fn conversations(&self) -> ChatResult<Url> {
        Ok(self.base.join("api/chat/conversations/")?)
    }

    pub fn unread(&self) -> ChatResult<Url> {
        Ok(self.base.join("api/chat/unread/")?)
    }

    pub fn conversation(&self, conversation_id: i64) -> ChatEndpoints {
        ChatEndpoints {
            api: self.clone(),
            conversation_id,
        }
    }
}

/// Locations scoped to a single conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEndpoints {
    api: ApiEndpoints,
    conversation_id: i64,
}

impl ChatEndpoints {
    pub fn api(&self) -> &ApiEndpoints {
        &self.api
    }

    pub fn conversation_id(&self) -> i64 {
        self.conversation_id
    }

    pub fn messages(&self) -> ChatResult<Url> {
        self.scoped("messages/")
    }

    pub fn send(&self) -> ChatResult<Url> {
        self.scoped("send/")
    }

    pub fn read(&self) -> ChatResult<Url> {
        self.scoped("read/")
    }

    pub fn archive(&self) -> ChatResult<Url> {
        self.scoped("archive/")
    }

    /// The stream URL: `http` becomes `ws`, `https` becomes `wss`.
    pub fn stream(&self) -> ChatResult<Url> {
        let mut url = self
            .api
            .base
            .join(&format!("ws/chat/{}/", self.conversation_id))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        set_scheme(&mut url, scheme)?;
        Ok(url)
    }

    fn scoped(&self, leaf: &str) -> ChatResult<Url> {
        Ok(self
            .api
            .base
            .join(&format!("api/chat/{}/{leaf}", self.conversation_id))?)
    }
}

fn set_scheme(url: &mut Url, scheme: &str) -> ChatResult<()> {
    url.set_scheme(scheme)
        .map_err(|_| ChatError::Config(format!("cannot switch {url} to {scheme}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_base_maps_to_wss_stream() {
        let chat = ApiEndpoints::parse("https://souk.example.com")
            .unwrap()
            .conversation(12);
        assert_eq!(
            chat.stream().unwrap().as_str(),
            "wss://souk.example.com/ws/chat/12/"
        );
        assert_eq!(
            chat.messages().unwrap().as_str(),
            "https://souk.example.com/api/chat/12/messages/"
        );
        assert_eq!(
            chat.send().unwrap().as_str(),
            "https://souk.example.com/api/chat/12/send/"
        );
        assert_eq!(
            chat.read().unwrap().as_str(),
            "https://souk.example.com/api/chat/12/read/"
        );
    }

    #[test]
    fn localhost_is_normalized_to_ipv4() {
        let api = ApiEndpoints::parse("localhost:8000").unwrap();
        assert_eq!(api.base().as_str(), "http://127.0.0.1:8000/");
        assert_eq!(
            api.conversation(3).stream().unwrap().as_str(),
            "ws://127.0.0.1:8000/ws/chat/3/"
        );
        assert_eq!(api.origin(), "http://127.0.0.1:8000");
    }

    #[test]
    fn bare_host_defaults_to_tls() {
        let api = ApiEndpoints::parse("souk.pythonanywhere.com").unwrap();
        assert_eq!(api.base().scheme(), "https");
        assert_eq!(api.host(), Some("souk.pythonanywhere.com"));
    }

    #[test]
    fn path_prefix_is_preserved() {
        let api = ApiEndpoints::parse("https://example.com/market?x=1").unwrap();
        assert_eq!(
            api.conversations().unwrap().as_str(),
            "https://example.com/market/api/chat/conversations/"
        );
        assert_eq!(
            api.unread().unwrap().as_str(),
            "https://example.com/market/api/chat/unread/"
        );
        assert_eq!(
            api.conversation(9).stream().unwrap().as_str(),
            "wss://example.com/market/ws/chat/9/"
        );
    }

    #[test]
    fn stream_scheme_base_is_accepted() {
        let api = ApiEndpoints::parse("wss://example.com").unwrap();
        assert_eq!(api.base().as_str(), "https://example.com/");
    }

    #[test]
    fn rejects_unknown_scheme_and_empty_input() {
        assert!(matches!(
            ApiEndpoints::parse("ftp://example.com"),
            Err(ChatError::Config(_))
        ));
        assert!(ApiEndpoints::parse("   ").is_err());
    }
}
