use std::time::Duration;

/// Outcome of waiting on a load lock that did not produce a value.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LockError<E> {
    /// The owner published a failure.
    #[error("load failed: {0}")]
    Failed(E),

    /// The owner went away without publishing anything.
    #[error("load owner abandoned the lock")]
    Abandoned,

    /// The waiter gave up before the owner published.
    #[error("gave up waiting after {0:?}")]
    Timeout(Duration),
}
