mod mailbox;
mod process;
mod supervisor;
mod system;

pub use mailbox::{Enqueued, Mailbox, OverflowPolicy, Queued};
pub use process::{
    Actor, DEFAULT_ASK_TIMEOUT, ProcessRef, ProcessStatus, ReplyTo, ScheduleId, StopReason, Tools,
};
pub use supervisor::{BackoffPolicy, RestartLimit, StrategyKind, SupervisionStrategy, Supervisor};
pub use system::{SpawnOptions, System};
