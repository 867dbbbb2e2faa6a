use crate::instant::Millis;

/// Runtime failure taxonomy for effect evaluation.
///
/// `User` carries an application-defined payload; the other variants are
/// injected by the runtime itself. Mailbox overflow is deliberately absent:
/// it is the boolean return of `send`, never an error value.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Fault<E> {
    /// A failure produced inside user code.
    #[error("{0}")]
    User(E),
    /// A `timeout(d)` fired before the inner effect completed.
    #[error("timed out after {0}ms")]
    Timeout(Millis),
    /// Cancellation propagated from a parent token.
    #[error("interrupted")]
    Interrupted,
}

impl<E> Fault<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }

    /// The user payload, if this is a user failure.
    pub fn into_user(self) -> Option<E> {
        match self {
            Self::User(e) => Some(e),
            _ => None,
        }
    }

    pub fn map_user<F>(self, f: impl FnOnce(E) -> F) -> Fault<F> {
        match self {
            Self::User(e) => Fault::User(f(e)),
            Self::Timeout(d) => Fault::Timeout(d),
            Self::Interrupted => Fault::Interrupted,
        }
    }
}

/// What every effect evaluation produces.
pub type Outcome<A, E> = Result<A, Fault<E>>;

/// Ways an `ask` can fail to produce a reply.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AskError {
    /// No reply arrived within the configured window.
    #[error("ask timed out after {0}ms")]
    Timeout(Millis),
    /// The asked process stopped before replying.
    #[error("process stopping")]
    Stopped,
    /// The ask message was refused by a full reject-policy mailbox.
    #[error("mailbox full")]
    MailboxFull,
}

/// Render a caught panic payload as a message.
///
/// Used wherever the runtime contains a user callback panic instead of
/// letting it tear down the worker.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
