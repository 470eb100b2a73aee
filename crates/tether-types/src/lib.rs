//! Pure data types for the tether relay daemon: wire frames, event-log
//! record shapes, and on-disk session/settings schemas. No async
//! runtime dependency so these types can be shared with anything that
//! just needs to read or write the wire/disk formats.

pub mod event_log;
pub mod frame;
pub mod session;

pub use event_log::{ContentItem, EventMessage, EventRecord, MessageContent, ToolResultContent};
pub use frame::{ClientFrame, PermissionBehavior, PermissionDecision, ServerFrame};
pub use session::{LaunchStrategy, RegistryDocument, Settings, SessionRecord, SessionStatus, ThreadBinding};
