// Error taxonomy for the reconciliation layer
use std::fmt;

#[derive(Debug, Clone)]
pub enum ReconcileError {
    // Referenced key absent
    NotFound(String),

    // Idempotency guards
    AlreadyRegistered(String),
    AlreadyApproved(String),
    AlreadyDisputed(String),
    DuplicateTransfer(String),

    // Validation
    InvalidAddress(String),
    InvalidAmount(String),
    InvalidInput(String),

    // Ledger executed but reverted; not retryable without changing input
    LedgerRejected(String),
    // Transient network/timeout; retryable with backoff. The underlying
    // transaction may still land later.
    LedgerUnavailable(String),

    // Cache I/O failure; retried asynchronously, never blocks a successful
    // ledger write from being acknowledged
    CacheUnavailable(String),

    Unknown(String),
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(key) => write!(f, "Not found: {}", key),
            Self::AlreadyRegistered(addr) => write!(f, "User {} already registered", addr),
            Self::AlreadyApproved(addr) => write!(f, "KYC for {} already approved", addr),
            Self::AlreadyDisputed(id) => write!(f, "Transfer {} already disputed", id),
            Self::DuplicateTransfer(id) => write!(f, "Transfer {} already exists", id),
            Self::InvalidAddress(addr) => write!(f, "Invalid address: {}", addr),
            Self::InvalidAmount(msg) => write!(f, "Invalid amount: {}", msg),
            Self::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Self::LedgerRejected(reason) => write!(f, "Ledger rejected: {}", reason),
            Self::LedgerUnavailable(reason) => write!(f, "Ledger unavailable: {}", reason),
            Self::CacheUnavailable(reason) => write!(f, "Cache unavailable: {}", reason),
            Self::Unknown(msg) => write!(f, "Unknown error: {}", msg),
        }
    }
}

impl std::error::Error for ReconcileError {}

impl From<anyhow::Error> for ReconcileError {
    fn from(err: anyhow::Error) -> Self {
        ReconcileError::Unknown(err.to_string())
    }
}

// Error code mapping for API responses
impl ReconcileError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyRegistered(_) => "ALREADY_REGISTERED",
            Self::AlreadyApproved(_) => "ALREADY_APPROVED",
            Self::AlreadyDisputed(_) => "ALREADY_DISPUTED",
            Self::DuplicateTransfer(_) => "DUPLICATE_TRANSFER",
            Self::InvalidAddress(_) => "INVALID_ADDRESS",
            Self::InvalidAmount(_) => "INVALID_AMOUNT",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::LedgerRejected(_) => "LEDGER_REJECTED",
            Self::LedgerUnavailable(_) => "LEDGER_UNAVAILABLE",
            Self::CacheUnavailable(_) => "CACHE_UNAVAILABLE",
            Self::Unknown(_) => "UNKNOWN_ERROR",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LedgerUnavailable(_) | Self::CacheUnavailable(_))
    }

    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::AlreadyRegistered(_)
                | Self::AlreadyApproved(_)
                | Self::AlreadyDisputed(_)
                | Self::DuplicateTransfer(_)
                | Self::InvalidAddress(_)
                | Self::InvalidAmount(_)
                | Self::InvalidInput(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = ReconcileError::DuplicateTransfer("TX_1".to_string());
        assert_eq!(err.error_code(), "DUPLICATE_TRANSFER");
        assert!(!err.is_retryable());
        assert!(err.is_user_error());

        let err2 = ReconcileError::LedgerUnavailable("timeout".to_string());
        assert_eq!(err2.error_code(), "LEDGER_UNAVAILABLE");
        assert!(err2.is_retryable());
        assert!(!err2.is_user_error());

        // Reverted executions must not be marked retryable: resubmitting
        // the same input reverts again.
        let err3 = ReconcileError::LedgerRejected("user already registered".to_string());
        assert!(!err3.is_retryable());
        assert!(!err3.is_user_error());
    }

    #[test]
    fn test_error_display() {
        let err = ReconcileError::AlreadyDisputed("TX_9".to_string());
        assert_eq!(err.to_string(), "Transfer TX_9 already disputed");
    }
}
