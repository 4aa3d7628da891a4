// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable error codes for the fleet backplane.
//!
//! Every backplane error carries an [`ErrorCode`] (a machine-readable, stable
//! string tag), a human-readable message, an optional cause chain, and
//! arbitrary key-value context.  Use the builder returned by
//! [`FleetError::new`] to construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Credential and provisioning-token failures.
    Auth,
    /// Malformed or rejected inbound requests.
    Request,
    /// License verification, feature gating, and admission control.
    License,
    /// Durable storage failures, transient or fatal.
    Storage,
    /// Key, signature, or wrap/unwrap failures.
    Crypto,
    /// Job lifecycle violations.
    Jobs,
    /// Configuration errors.
    Config,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auth => "auth",
            Self::Request => "request",
            Self::License => "license",
            Self::Storage => "storage",
            Self::Crypto => "crypto",
            Self::Jobs => "jobs",
            Self::Config => "config",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Auth --
    /// Credentials or provisioning token rejected.
    Unauthorized,
    /// The presented provisioning key is unknown, exhausted, or expired.
    ProvisioningKeyInvalid,

    // -- Request --
    /// Payload failed to parse or has missing/invalid fields.
    BadRequest,
    /// The addressed resource does not exist.
    NotFound,
    /// Too many attempts from one source identity.
    RateLimited,
    /// The caller deadline elapsed before the operation completed.
    DeadlineExceeded,

    // -- License --
    /// The license envelope is past its validity window.
    LicenseExpired,
    /// The license envelope failed signature or claim validation.
    LicenseInvalid,
    /// The requested feature is not covered by the license.
    LicenseFeatureDenied,
    /// Admitting the device would exceed a licensed limit.
    LicenseLimitExceeded,

    // -- Storage --
    /// Transient storage failure; the caller should retry with backoff.
    RetryableStorage,
    /// Stored data violates a documented invariant; no silent repair.
    InvariantViolation,

    // -- Crypto --
    /// Key, signature, or wrap/unwrap failure.
    CryptoFailure,

    // -- Jobs --
    /// The requested job status transition is not allowed.
    InvalidJobTransition,

    // -- Config --
    /// Configuration file or value is invalid.
    ConfigInvalid,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Unauthorized | Self::ProvisioningKeyInvalid => ErrorCategory::Auth,

            Self::BadRequest | Self::NotFound | Self::RateLimited | Self::DeadlineExceeded => {
                ErrorCategory::Request
            }

            Self::LicenseExpired
            | Self::LicenseInvalid
            | Self::LicenseFeatureDenied
            | Self::LicenseLimitExceeded => ErrorCategory::License,

            Self::RetryableStorage | Self::InvariantViolation => ErrorCategory::Storage,

            Self::CryptoFailure => ErrorCategory::Crypto,

            Self::InvalidJobTransition => ErrorCategory::Jobs,

            Self::ConfigInvalid => ErrorCategory::Config,

            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"LICENSE_LIMIT_EXCEEDED"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::ProvisioningKeyInvalid => "PROVISIONING_KEY_INVALID",
            Self::BadRequest => "BAD_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::LicenseExpired => "LICENSE_EXPIRED",
            Self::LicenseInvalid => "LICENSE_INVALID",
            Self::LicenseFeatureDenied => "LICENSE_FEATURE_DENIED",
            Self::LicenseLimitExceeded => "LICENSE_LIMIT_EXCEEDED",
            Self::RetryableStorage => "RETRYABLE_STORAGE",
            Self::InvariantViolation => "INVARIANT_VIOLATION",
            Self::CryptoFailure => "CRYPTO_FAILURE",
            Self::InvalidJobTransition => "INVALID_JOB_TRANSITION",
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::Internal => "INTERNAL",
        }
    }

    /// Returns `true` when a caller may retry the same request unchanged and
    /// reasonably expect it to succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryableStorage | Self::RateLimited)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// FleetError
// ---------------------------------------------------------------------------

/// Unified backplane error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use fbp_error::{ErrorCode, FleetError};
///
/// let err = FleetError::new(ErrorCode::LicenseLimitExceeded, "device limit reached")
///     .with_context("limit", 3)
///     .with_context("active", 3);
/// ```
pub struct FleetError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl FleetError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Shorthand for `self.code.is_retryable()`.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    // -- Convenience constructors for the common codes ----------------------

    /// Credential or provisioning failure.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// Malformed payload, rejected without state change.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    /// The addressed resource does not exist.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// Transient storage failure.
    pub fn retryable_storage(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RetryableStorage, message)
    }

    /// Stored data violates a documented invariant.
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvariantViolation, message)
    }

    /// Key, signature, or wrap/unwrap failure.
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CryptoFailure, message)
    }

    /// Unexpected internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl fmt::Debug for FleetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("FleetError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for FleetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for FleetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Convenience alias used across backplane crates.
pub type FleetResult<T> = Result<T, FleetError>;

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`FleetError`] (without the opaque source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&FleetError> for FleetErrorDto {
    fn from(err: &FleetError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<FleetErrorDto> for FleetError {
    fn from(dto: FleetErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
