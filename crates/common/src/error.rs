//! Common error types for ChatGate
//!
//! This module defines the error taxonomy shared by the worker and the server.
//! Every error knows its HTTP status and the message that may be shown to a client;
//! the full `Display` text stays server-side.

use thiserror::Error;

/// Message returned to clients for empty chat requests
pub const EMPTY_MESSAGE_DETAIL: &str = "Empty request: Please provide a message";

/// Message returned to clients for every internal failure
pub const INTERNAL_ERROR_DETAIL: &str = "Internal server error: Please try again later";

/// Inline body served when the home page template is missing
pub const TEMPLATE_MISSING_BODY: &str = "<h1>Error: Template file not found</h1>";

/// Main error type for ChatGate
#[derive(Error, Debug)]
pub enum ChatGateError {
    /// Client supplied an unusable request
    #[error("Validation error: {0}")]
    Validation(String),

    /// Model or tokenizer artifacts unavailable or malformed
    #[error("Resource load error: {0}")]
    ResourceLoad(String),

    /// Failure while tokenizing, generating or decoding
    #[error("Inference error: {0}")]
    Inference(String),

    /// Home page template absent
    #[error("Template missing: {0}")]
    TemplateMissing(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChatGateError {
    /// HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            ChatGateError::Validation(_) => 400,
            _ => 500,
        }
    }

    /// Whether the caller is at fault
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// Text that is safe to send across the HTTP boundary.
    ///
    /// Client errors carry their own message; everything else collapses to a
    /// fixed string so that paths and causes never leak.
    pub fn public_message(&self) -> &str {
        match self {
            ChatGateError::Validation(msg) => msg,
            ChatGateError::TemplateMissing(_) => TEMPLATE_MISSING_BODY,
            _ => INTERNAL_ERROR_DETAIL,
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        ChatGateError::Validation(msg.into())
    }

    /// Create a resource load error
    pub fn resource_load(msg: impl Into<String>) -> Self {
        ChatGateError::ResourceLoad(msg.into())
    }

    /// Create an inference error
    pub fn inference(msg: impl Into<String>) -> Self {
        ChatGateError::Inference(msg.into())
    }

    /// Create a template missing error
    pub fn template_missing(msg: impl Into<String>) -> Self {
        ChatGateError::TemplateMissing(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ChatGateError::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        ChatGateError::Internal(msg.into())
    }
}

/// Result type alias for ChatGate operations
pub type Result<T> = std::result::Result<T, ChatGateError>;
