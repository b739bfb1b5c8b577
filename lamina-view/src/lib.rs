//! The editor façade: a session that owns one buffer and one language server
//! client and keeps cursor motion, edits, and structured queries mutually
//! consistent.

mod completion;
mod session;

pub use completion::{
    CompletionSource, CompletionStream, LspCompletionSource, NoopCompletionSource,
};
pub use session::{EditorSession, Result, SessionError};
