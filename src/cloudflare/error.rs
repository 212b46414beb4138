//! Cloudflare API errors

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// DNS record codes returned when an equivalent record already exists
const ALREADY_EXISTS_CODES: [i64; 3] = [81053, 81057, 81058];

/// "Record does not exist"
const RECORD_NOT_FOUND_CODE: i64 = 81044;

/// One entry of the `errors` array of a v4 response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub code: i64,
    pub message: String,
}

impl ApiErrorDetail {
    pub fn new(code: i64, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }
}

fn join_details(errors: &[ApiErrorDetail]) -> String {
    let messages: Vec<String> = errors
        .iter()
        .map(|e| format!("{} ({})", e.message, e.code))
        .collect();
    messages.join(", ")
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Cloudflare API returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Cloudflare API error: {}", join_details(.errors))]
    Api {
        status: u16,
        errors: Vec<ApiErrorDetail>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no result in Cloudflare API response")]
    MissingResult,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Conflict(String),

    #[error("request cancelled")]
    Cancelled,
}

impl ApiError {
    /// Build an API error from a single code and message
    pub fn api(status: u16, code: i64, message: &str) -> Self {
        ApiError::Api {
            status,
            errors: vec![ApiErrorDetail::new(code, message)],
        }
    }

    /// The remote resource is already gone
    pub fn is_not_found(&self) -> bool {
        match self {
            ApiError::NotFound(_) => true,
            ApiError::Status { status, .. } => *status == 404,
            ApiError::Api { status, errors } => {
                *status == 404
                    || errors.iter().any(|e| {
                        let message = e.message.to_ascii_lowercase();
                        e.code == RECORD_NOT_FOUND_CODE
                            || message.contains("does not exist")
                            || message.contains("not found")
                    })
            }
            _ => false,
        }
    }

    /// Creation failed because an equivalent resource exists
    pub fn is_already_exists(&self) -> bool {
        match self {
            ApiError::Api { errors, .. } => errors.iter().any(|e| {
                ALREADY_EXISTS_CODES.contains(&e.code)
                    || e.message.to_ascii_lowercase().contains("already exists")
            }),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ApiError::Cancelled)
    }
}
