//! Failure categories and the retry classifier.

use serde::{Deserialize, Serialize};

/// Why a payout (or payout attempt) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Destination account no longer exists.
    AccountClosed,
    /// Account number, holder name, currency, etc. are wrong.
    InvalidAccountDetails,
    /// Frozen/restricted account or a regulatory hold.
    ComplianceBlock,
    InsufficientFunds,
    /// The provider declined or could not process the transfer.
    ProviderError,
    NetworkError,
    RateLimited,
    Unknown,
}

impl FailureCategory {
    /// Categories that can never succeed on retry.
    pub const NON_RETRYABLE: [FailureCategory; 3] = [
        FailureCategory::AccountClosed,
        FailureCategory::InvalidAccountDetails,
        FailureCategory::ComplianceBlock,
    ];

    pub fn is_retryable(self) -> bool {
        !Self::NON_RETRYABLE.contains(&self)
    }

    /// Retry decision for an optional category.
    ///
    /// Fail-open: a missing or unrecognized category is retryable; only the
    /// explicitly permanent conditions suppress retries.
    pub fn should_retry(category: Option<FailureCategory>) -> bool {
        category.is_none_or(FailureCategory::is_retryable)
    }

    /// Map a provider failure code onto a category.
    pub fn from_failure_code(code: &str) -> Self {
        match code {
            "account_closed" => Self::AccountClosed,
            "no_account"
            | "invalid_account_number"
            | "invalid_currency"
            | "incorrect_account_holder_name"
            | "incorrect_account_holder_address"
            | "incorrect_account_holder_tax_id"
            | "bank_ownership_changed"
            | "unsupported_card" => Self::InvalidAccountDetails,
            "account_frozen" | "bank_account_restricted" | "debit_not_authorized" => {
                Self::ComplianceBlock
            }
            "insufficient_funds" => Self::InsufficientFunds,
            "declined" | "could_not_process" => Self::ProviderError,
            "api_connection_error" | "timeout" => Self::NetworkError,
            "rate_limit" => Self::RateLimited,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AccountClosed => "account_closed",
            Self::InvalidAccountDetails => "invalid_account_details",
            Self::ComplianceBlock => "compliance_block",
            Self::InsufficientFunds => "insufficient_funds",
            Self::ProviderError => "provider_error",
            Self::NetworkError => "network_error",
            Self::RateLimited => "rate_limited",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "account_closed" => Some(Self::AccountClosed),
            "invalid_account_details" => Some(Self::InvalidAccountDetails),
            "compliance_block" => Some(Self::ComplianceBlock),
            "insufficient_funds" => Some(Self::InsufficientFunds),
            "provider_error" => Some(Self::ProviderError),
            "network_error" => Some(Self::NetworkError),
            "rate_limited" => Some(Self::RateLimited),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl core::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_categories_suppress_retry() {
        for category in FailureCategory::NON_RETRYABLE {
            assert!(!FailureCategory::should_retry(Some(category)), "{category}");
        }
    }

    #[test]
    fn unknown_and_missing_categories_are_retryable() {
        assert!(FailureCategory::should_retry(None));
        assert!(FailureCategory::should_retry(Some(FailureCategory::Unknown)));
        assert!(FailureCategory::should_retry(Some(FailureCategory::InsufficientFunds)));
        assert!(FailureCategory::should_retry(Some(FailureCategory::NetworkError)));
    }

    #[test]
    fn failure_codes_map_to_categories() {
        assert_eq!(
            FailureCategory::from_failure_code("account_closed"),
            FailureCategory::AccountClosed
        );
        assert_eq!(
            FailureCategory::from_failure_code("no_account"),
            FailureCategory::InvalidAccountDetails
        );
        assert_eq!(
            FailureCategory::from_failure_code("account_frozen"),
            FailureCategory::ComplianceBlock
        );
        assert_eq!(
            FailureCategory::from_failure_code("something_new"),
            FailureCategory::Unknown
        );
    }
}
