//! Request/response chat API used by the poll transport, history paging and
//! the account-level CLI commands.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chat_core::{Message, MessageId, MessagePage};
use reqwest::header::{ACCEPT, COOKIE, HeaderMap, HeaderValue, REFERER};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::SessionAuth;
use crate::endpoints::{ApiEndpoints, ChatEndpoints};
use crate::error::{ChatError, ChatResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const CSRF_HEADER: &str = "X-CSRFToken";

/// Parameters of one `messages/` list call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListQuery {
    pub before: Option<MessageId>,
    pub limit: u32,
}

impl ListQuery {
    /// The newest page of the conversation.
    pub fn latest(limit: u32) -> Self {
        Self {
            before: None,
            limit,
        }
    }

    pub fn before(before: MessageId, limit: u32) -> Self {
        Self {
            before: Some(before),
            limit,
        }
    }

    fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("limit", self.limit.to_string())];
        if let Some(before) = self.before {
            params.push(("before", before.to_string()));
        }
        params
    }
}

/// Conversation-scoped calls the connection manager depends on.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_messages(&self, query: ListQuery) -> ChatResult<MessagePage>;

    /// Persists a message and returns it as stored by the server.
    async fn send_message(&self, content: &str) -> ChatResult<Message>;

    /// Marks every message in the conversation as read for the current user.
    async fn mark_read(&self) -> ChatResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Participant {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListingSummary {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LastMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub is_mine: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConversationSummary {
    pub id: i64,
    pub other_user: Participant,
    #[serde(default)]
    pub property: Option<ListingSummary>,
    #[serde(default)]
    pub unread_count: u64,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UnreadSummary {
    #[serde(default)]
    pub total_unread: u64,
    /// Keyed by conversation id; JSON object keys arrive as strings.
    #[serde(default)]
    pub by_conversation: HashMap<String, u64>,
}

/// `{success, error?, ...}`; the remaining fields are the payload.
#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    body: serde_json::Map<String, serde_json::Value>,
}

impl Envelope {
    fn into_body<T: DeserializeOwned>(self) -> ChatResult<T> {
        serde_json::from_value(serde_json::Value::Object(self.body))
            .map_err(|err| ChatError::Rejected(format!("invalid response body: {err}")))
    }
}

#[derive(Debug, Deserialize)]
struct SendBody {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct ConversationsBody {
    conversations: Vec<ConversationSummary>,
}

#[derive(Debug, Deserialize)]
struct Empty {}

/// Authenticated HTTP client for one chat server.
#[derive(Clone)]
pub struct HttpClient {
    http: reqwest::Client,
    api: ApiEndpoints,
    csrf_token: Option<String>,
}

impl HttpClient {
    pub fn new(api: ApiEndpoints, auth: &SessionAuth) -> ChatResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(cookie) = auth.cookie_header() {
            headers.insert(COOKIE, header_value(&cookie)?);
        }
        // Django rejects HTTPS POSTs whose Referer does not match the host.
        headers.insert(REFERER, header_value(&format!("{}/", api.origin()))?);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            api,
            csrf_token: auth.csrf_token.clone(),
        })
    }

    pub fn endpoints(&self) -> &ApiEndpoints {
        &self.api
    }

    pub fn conversation(&self, conversation_id: i64) -> HttpChatApi {
        HttpChatApi {
            client: self.clone(),
            endpoints: self.api.conversation(conversation_id),
        }
    }

    pub async fn conversations(&self) -> ChatResult<Vec<ConversationSummary>> {
        let url = self.api.conversations()?;
        debug!(target = "chat.http", %url, "listing conversations");
        let body: ConversationsBody = read_envelope(self.http.get(url).send().await?).await?;
        Ok(body.conversations)
    }

    pub async fn unread(&self) -> ChatResult<UnreadSummary> {
        let url = self.api.unread()?;
        debug!(target = "chat.http", %url, "fetching unread counts");
        read_envelope(self.http.get(url).send().await?).await
    }

    /// Moves a conversation out of the active list.
    pub async fn archive(&self, conversation_id: i64) -> ChatResult<()> {
        let url = self.api.conversation(conversation_id).archive()?;
        debug!(target = "chat.http", %url, "archiving conversation");
        let _: Empty = read_envelope(self.post(url).send().await?).await?;
        Ok(())
    }

    fn post(&self, url: url::Url) -> reqwest::RequestBuilder {
        let request = self.http.post(url);
        match &self.csrf_token {
            Some(token) => request.header(CSRF_HEADER, token),
            None => request,
        }
    }
}

/// [`ChatApi`] over the server's JSON endpoints.
#[derive(Clone)]
pub struct HttpChatApi {
    client: HttpClient,
    endpoints: ChatEndpoints,
}

impl HttpChatApi {
    pub fn endpoints(&self) -> &ChatEndpoints {
        &self.endpoints
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_messages(&self, query: ListQuery) -> ChatResult<MessagePage> {
        let url = self.endpoints.messages()?;
        debug!(
            target = "chat.http",
            conversation = self.endpoints.conversation_id(),
            before = ?query.before,
            limit = query.limit,
            "listing messages"
        );
        let response = self
            .client
            .http
            .get(url)
            .query(&query.params())
            .send()
            .await?;
        read_envelope(response).await
    }

    async fn send_message(&self, content: &str) -> ChatResult<Message> {
        let url = self.endpoints.send()?;
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "message": content }))
            .send()
            .await?;
        let body: SendBody = read_envelope(response).await?;
        debug!(
            target = "chat.http",
            conversation = self.endpoints.conversation_id(),
            message_id = body.message.id,
            "message sent over http"
        );
        Ok(body.message)
    }

    async fn mark_read(&self) -> ChatResult<()> {
        let url = self.endpoints.read()?;
        let _: Empty = read_envelope(self.client.post(url).send().await?).await?;
        Ok(())
    }
}

/// Decodes a `{success, error?, ...}` envelope.
///
/// Error statuses still carry a JSON envelope (e.g. 400 on an empty message),
/// so the body is read before the status is considered.
async fn read_envelope<T: DeserializeOwned>(response: reqwest::Response) -> ChatResult<T> {
    let status = response.status();
    let bytes = response.bytes().await?;
    let envelope: Envelope = match serde_json::from_slice(&bytes) {
        Ok(envelope) => envelope,
        Err(err) if status.is_success() => {
            warn!(target = "chat.http", %status, error = %err, "undecodable response body");
            return Err(ChatError::Rejected(format!("invalid response body: {err}")));
        }
        Err(_) => return Err(ChatError::Rejected(format!("http status {status}"))),
    };
    if !envelope.success {
        let reason = envelope.error.unwrap_or_else(|| format!("http status {status}"));
        return Err(ChatError::Rejected(reason));
    }
    envelope.into_body().inspect_err(|err| {
        warn!(target = "chat.http", %status, error = %err, "unexpected response payload");
    })
}

fn header_value(value: &str) -> ChatResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|err| ChatError::Config(format!("invalid header value: {err}")))
}
