mod cancel;
mod effect;
mod env;
mod fiber;
mod retry;
mod runner;
mod scope;

pub use cancel::{CancelListener, CancelToken};
pub use effect::Effect;
pub use env::Env;
pub use fiber::Fiber;
pub use retry::RetryPolicy;
pub use runner::Runner;
pub use scope::{ExitCause, FinalizerScope, ScopeClosed};

pub use praxis_types::{Fault, Outcome};
