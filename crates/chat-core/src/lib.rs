//! Transport-agnostic core of the souk chat client.
//!
//! Everything in this crate is synchronous and free of I/O: the message
//! ledger, the JSON frame codec, the connection state machine, the typing
//! debouncer and the history pagination controller. The async driver that
//! owns sockets and timers lives in the `souk-chat` app and feeds events into
//! these types.

pub mod error;
pub mod frame;
pub mod ledger;
pub mod machine;
pub mod model;
pub mod pagination;
pub mod typing;

pub use error::ProtocolError;
pub use frame::{ClientFrame, ServerFrame};
pub use ledger::{Ingest, MessageLedger};
pub use machine::{
    ConnectionState, Effect, FallbackReason, Generation, Machine, MachineConfig, MachineEvent,
};
pub use model::{Message, MessageId, MessagePage, UserId};
pub use pagination::{LoadDecision, PageOutcome, PaginationController};
pub use typing::{ActivityOutcome, RemoteTyping, TypingSignaler};
