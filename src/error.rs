//! Error types for stockwatch
//!
//! This module defines the closed error taxonomy returned by the remote store
//! and the synchronizer, plus the per-field validation errors shown to users
//! when a holding form is rejected.

use std::fmt;

use thiserror::Error;

/// Field-level validation errors for a holding draft.
///
/// These errors are shown directly to users and should be clear and actionable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Company name is required.")]
    CompanyNameRequired,

    #[error("Ticker symbol is required.")]
    TickerRequired,

    #[error("Ticker symbol must be uppercase letters.")]
    TickerNotUppercase,

    #[error("Price must be a positive number.")]
    InvalidPrice,

    #[error("Quantity must be a positive integer.")]
    InvalidQuantity,
}

/// The form field a [`ValidationError`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    CompanyName,
    TickerSymbol,
    Price,
    Quantity,
}

impl ValidationError {
    pub fn field(&self) -> Field {
        match self {
            ValidationError::CompanyNameRequired => Field::CompanyName,
            ValidationError::TickerRequired | ValidationError::TickerNotUppercase => {
                Field::TickerSymbol
            }
            ValidationError::InvalidPrice => Field::Price,
            ValidationError::InvalidQuantity => Field::Quantity,
        }
    }
}

/// Every violation found in one draft, in field order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(Vec<ValidationError>);

impl ValidationErrors {
    pub fn push(&mut self, error: ValidationError) {
        self.0.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }

    /// The error reported for `field`, if any.
    pub fn for_field(&self, field: Field) -> Option<&ValidationError> {
        self.iter().find(|e| e.field() == field)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", messages.join(" "))
    }
}

impl std::error::Error for ValidationErrors {}

/// Tag for pattern matching on [`StoreError`] without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Validation,
    Conflict,
    NotFound,
    QuoteUnavailable,
}

/// Errors produced by the remote store client and the synchronizer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The request failed to complete, or the server answered with an
    /// unexpected status or body.
    #[error("network error{}: {message}", status_suffix(.status))]
    Network {
        status: Option<u16>,
        message: String,
    },

    /// Rejected client-side before anything was sent.
    #[error("invalid holding: {0}")]
    Validation(#[from] ValidationErrors),

    /// A holding with this ticker already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no holding with ticker {0}")]
    NotFound(String),

    #[error("quote unavailable for {ticker}: {reason}")]
    QuoteUnavailable { ticker: String, reason: String },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl StoreError {
    pub fn network(message: impl Into<String>) -> Self {
        StoreError::Network {
            status: None,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Network { .. } => ErrorKind::Network,
            StoreError::Validation(_) => ErrorKind::Validation,
            StoreError::Conflict(_) => ErrorKind::Conflict,
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::QuoteUnavailable { .. } => ErrorKind::QuoteUnavailable,
        }
    }

    /// The message shown to the user when a create, update, or delete fails.
    pub fn user_message(&self) -> String {
        match self {
            StoreError::Conflict(_) => "A stock with this ticker symbol already exists.".to_string(),
            StoreError::Network {
                status: Some(500), ..
            } => "An error occurred while adding the stock.".to_string(),
            StoreError::Validation(errors) => errors.to_string(),
            StoreError::NotFound(ticker) => format!("No stock with ticker {ticker} exists."),
            _ => "An unknown error occurred.".to_string(),
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Network {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}
