//! Error taxonomy shared by the workflow, the policy and the service layer

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Please provide expense title")]
    MissingTitle,
    #[error("Please provide expense amount")]
    MissingAmount,
    #[error("Amount cannot be negative")]
    NegativeAmount,
    #[error("Please provide currency")]
    MissingCurrency,
    #[error("'{0}' is not a valid ISO 4217 currency code")]
    InvalidCurrency(String),
    #[error("Please provide expense category")]
    MissingCategory,
    #[error("'{0}' is not a supported expense category")]
    UnknownCategory(String),
    #[error("Please provide expense date")]
    MissingDate,
    #[error("Expense date {0} is out of the supported range")]
    InvalidDate(String),
    #[error("Please provide at least one field to update")]
    NothingToUpdate,
    #[error("Please provide a rejection reason")]
    EmptyRejectionReason,
    #[error("'{0}' is not a known role")]
    UnknownRole(String),
    #[error("'{0}' is not a known expense status")]
    UnknownStatus(String),
}

#[derive(thiserror::Error, Debug)]
pub enum ExpenseError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    InvalidTransition(String),
    #[error("{0}")]
    NotFound(String),
    #[error("storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

impl ExpenseError {
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }
    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Self::InvalidTransition(message.into())
    }
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Short machine readable name of the failure class, used when reporting to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::NotFound(_) => "not_found",
            Self::Storage(_) => "storage",
        }
    }
}
