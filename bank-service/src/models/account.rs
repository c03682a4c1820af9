//! Account model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::{Validate, ValidationError};

/// Customer account holding a balance in one currency.
///
/// `balance` is in the currency's smallest unit and never negative in a
/// committed state. `version` is bumped by every write to the row, transfers
/// included, so callers can detect stale direct updates.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub owner: String,
    pub balance: i64,
    pub currency: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a new account.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CreateAccount {
    #[validate(length(min = 1, max = 255, message = "owner must be 1-255 characters"))]
    pub owner: String,
    #[validate(range(min = 0, message = "balance must not be negative"))]
    pub balance: i64,
    #[validate(custom(function = "validate_currency"))]
    pub currency: String,
}

/// Input for changing an account's descriptive fields.
///
/// Currency is fixed at creation and cannot be changed here.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct UpdateAccount {
    #[validate(length(min = 1, max = 255, message = "owner must be 1-255 characters"))]
    pub owner: String,
    /// Expected current version; the update is refused if the row moved on.
    #[serde(default)]
    pub version: Option<i64>,
}

/// Input for an administrative balance override.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct UpdateBalance {
    #[validate(range(min = 0, message = "balance must not be negative"))]
    pub balance: i64,
    #[serde(default)]
    pub version: Option<i64>,
}

/// Currency codes are three upper-case ASCII letters (`USD`, `EUR`, `INR`).
pub fn validate_currency(code: &str) -> Result<(), ValidationError> {
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("currency");
        err.message = Some("currency must be a three-letter upper-case code".into());
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(owner: &str, balance: i64, currency: &str) -> CreateAccount {
        CreateAccount {
            owner: owner.to_string(),
            balance,
            currency: currency.to_string(),
        }
    }

    #[test]
    fn accepts_well_formed_account() {
        assert!(create("Alice", 1000, "USD").validate().is_ok());
        assert!(create("Bob", 0, "EUR").validate().is_ok());
    }

    #[test]
    fn rejects_negative_opening_balance() {
        let errors = create("Alice", -1, "USD").validate().unwrap_err();
        assert!(errors.field_errors().contains_key("balance"));
    }

    #[test]
    fn rejects_empty_owner() {
        let errors = create("", 10, "USD").validate().unwrap_err();
        assert!(errors.field_errors().contains_key("owner"));
    }

    #[test]
    fn rejects_malformed_currency() {
        for code in ["usd", "US", "USDT", "U$D", ""] {
            let errors = create("Alice", 10, code).validate().unwrap_err();
            assert!(
                errors.field_errors().contains_key("currency"),
                "{code} should be rejected"
            );
        }
    }

    #[test]
    fn balance_override_must_not_be_negative() {
        let input = UpdateBalance {
            balance: -5,
            version: None,
        };
        assert!(input.validate().is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let parsed: Result<CreateAccount, _> = serde_json::from_str(
            r#"{"owner":"Alice","balance":1,"currency":"USD","overdraft":true}"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn update_version_is_optional() {
        let parsed: UpdateBalance = serde_json::from_str(r#"{"balance":250}"#).unwrap();
        assert_eq!(parsed.balance, 250);
        assert_eq!(parsed.version, None);
    }
}
