mod buffer;
mod readonly;

pub use buffer::{Buffer, EditError, Position};
pub use readonly::{ReadonlySpans, Span};

pub use ropey::{Rope, RopeSlice};
