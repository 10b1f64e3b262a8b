pub mod cli;
pub mod config;
pub mod endpoints;
pub mod environment;
pub mod error;
pub mod http;
pub mod manager;
pub mod telemetry;
pub mod transport;

pub use config::{ClientConfig, SessionAuth};
pub use endpoints::{ApiEndpoints, ChatEndpoints};
pub use environment::{EnvironmentProbe, HostSuffixProbe, StaticProbe};
pub use error::{ChatError, ChatResult};
pub use http::{ChatApi, HttpChatApi, HttpClient, ListQuery};
pub use manager::{ChatEvent, ChatHandle, ConnectionManager, HistoryPage, ManagerConfig};
