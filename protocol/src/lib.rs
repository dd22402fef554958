//! Serde types shared between the bb7 backend and its editor frontend: the
//! durable chat data model (persisted as `chat.json` inside the project) and
//! the newline-delimited JSON wire protocol spoken over stdin/stdout.

mod model;
mod wire;

pub use model::CHAT_SCHEMA_VERSION;
pub use model::Chat;
pub use model::ChatIndex;
pub use model::ChatSummary;
pub use model::ContextAction;
pub use model::ContextEvent;
pub use model::ContextFile;
pub use model::DiffMode;
pub use model::FileStatusEntry;
pub use model::Message;
pub use model::MessagePart;
pub use model::ReasoningEffort;
pub use model::Role;
pub use model::SnapshotRef;
pub use model::TokenUsage;
pub use wire::DiffErrorDetail;
pub use wire::DiffPaths;
pub use wire::ForkWarning;
pub use wire::ForkWarningKind;
pub use wire::Request;
pub use wire::RequestId;
pub use wire::RequestOp;
pub use wire::Response;
pub use wire::ResponseBody;
pub use wire::SearchResult;
