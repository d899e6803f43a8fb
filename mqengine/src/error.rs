use std::cell::RefCell;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("client id required")]
    ClientIdRequired,
    #[error("destination not valid, {0}")]
    DestNotValid(String),
    #[error("invalid parameter, {0}")]
    InvalidParameter(String),
    #[error("argument not valid")]
    ArgNotValid,

    #[error("object has been destroyed")]
    Destroyed,
    #[error("request already in progress")]
    RequestInProgress,
    #[error("too many consumers")]
    TooManyConsumers,
    #[error("session is not under engine control")]
    NotEngineControlled,
    #[error("waiter already disabled")]
    WaiterDisabled,
    #[error("waiter already enabled")]
    WaiterEnabled,
    #[error("pending waiter disable cancelled")]
    DisableWaiterCancel,
    #[error("waiter invalid")]
    WaiterInvalid,

    #[error("allocation failed")]
    AllocateError,
    #[error("destination full")]
    DestinationFull,

    #[error("not found")]
    NotFound,
    #[error("destination in use")]
    DestinationInUse,
    #[error("destination not empty")]
    DestinationNotEmpty,
    #[error("destination type not valid")]
    DestTypeNotValid,
    #[error("send not allowed")]
    SendNotAllowed,
    #[error("not authorized")]
    NotAuthorized,
    #[error("client id in use")]
    ClientIdInUse,

    #[error("transaction in use")]
    TransactionInUse,
    #[error("invalid operation")]
    InvalidOperation,
    #[error("transaction rolled back")]
    RolledBack,
    #[error("transaction heuristically committed")]
    HeuristicallyCommitted,
    #[error("transaction heuristically rolled back")]
    HeuristicallyRolledBack,

    #[error("store error, {0}")]
    Store(String),
    #[error("engine halted after a fatal error")]
    Halted,
}

impl EngineError {
    /// A concurrent transition the caller may treat as informational
    #[inline]
    pub fn is_state_conflict(&self) -> bool {
        matches!(
            self,
            EngineError::Destroyed
                | EngineError::RequestInProgress
                | EngineError::TooManyConsumers
                | EngineError::NotEngineControlled
                | EngineError::WaiterDisabled
                | EngineError::WaiterEnabled
                | EngineError::InvalidOperation
        )
    }

    #[inline]
    pub fn is_heuristic(&self) -> bool {
        matches!(self, EngineError::HeuristicallyCommitted | EngineError::HeuristicallyRolledBack)
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<EngineError>> = const { RefCell::new(None) };
}

/// Error detail recorded by the most recent failing entry point on this thread
pub fn last_error() -> Option<EngineError> {
    LAST_ERROR.with(|e| e.borrow().clone())
}

pub fn clear_last_error() {
    LAST_ERROR.with(|e| *e.borrow_mut() = None);
}

/// Entry points pass their result through here before returning it
#[inline]
pub(crate) fn finalize<T>(res: Result<T>) -> Result<T> {
    if let Err(e) = &res {
        LAST_ERROR.with(|l| *l.borrow_mut() = Some(e.clone()));
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_error_is_thread_local() {
        clear_last_error();
        let r: Result<()> = finalize(Err(EngineError::NotFound));
        assert!(r.is_err());
        assert_eq!(last_error(), Some(EngineError::NotFound));

        std::thread::spawn(|| assert_eq!(last_error(), None)).join().unwrap();

        let _ = finalize(Ok(1));
        assert_eq!(last_error(), Some(EngineError::NotFound));
        clear_last_error();
        assert_eq!(last_error(), None);
    }

    #[test]
    fn test_classification() {
        assert!(EngineError::WaiterEnabled.is_state_conflict());
        assert!(EngineError::InvalidOperation.is_state_conflict());
        assert!(!EngineError::NotFound.is_state_conflict());
        assert!(EngineError::HeuristicallyRolledBack.is_heuristic());
    }
}
