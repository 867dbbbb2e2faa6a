pub mod error;
pub mod event;
pub mod instant;
pub mod process_id;

pub use error::{AskError, Fault, Outcome, panic_message};
pub use event::{Event, EventKind, EventLog, EventSink};
pub use instant::{Instant, Millis};
pub use process_id::ProcessId;
