use crate::errors::{VaultError, VaultResult};
use regex::Regex;

/// Upper bound on a single payment fee, in satoshis.
pub const MAX_FEE_SATS: u64 = 10_000_000;
pub const MAX_CONTRACT_NAME: usize = 64;
pub const MAX_ENCODED_INPUT: usize = 64 * 1024;
pub const MIN_PASSWORD_LENGTH: usize = 12;
pub const MAX_FREE_TEXT: usize = 256;

/// Input validation for user-supplied vault parameters
pub struct InputValidator {
    name_pattern: Regex,
    malicious_patterns: Vec<Regex>,
}

impl InputValidator {
    pub fn new() -> VaultResult<Self> {
        let name_pattern = Regex::new(r"^[\p{L}\p{N}][\p{L}\p{N} ._\-]*$")
            .map_err(|e| VaultError::Validation(format!("Invalid name regex: {}", e)))?;

        let malicious_patterns = [
            r"<script",
            r"javascript:",
            r"data:text/html",
            r"vbscript:",
            r"onload=",
            r"onerror=",
        ]
        .iter()
        .map(|pattern| {
            Regex::new(pattern)
                .map_err(|e| VaultError::Validation(format!("Invalid pattern regex: {}", e)))
        })
        .collect::<VaultResult<Vec<_>>>()?;

        Ok(InputValidator {
            name_pattern,
            malicious_patterns,
        })
    }

    /// Validate a contract display name
    pub fn validate_contract_name(&self, name: &str) -> VaultResult<()> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(VaultError::Validation(
                "Contract name cannot be empty".to_string(),
            ));
        }

        if trimmed.chars().count() > MAX_CONTRACT_NAME {
            return Err(VaultError::Validation(
                "Contract name too long".to_string(),
            ));
        }

        if !self.name_pattern.is_match(trimmed) {
            return Err(VaultError::Validation(
                "Contract name contains invalid characters".to_string(),
            ));
        }

        Ok(())
    }

    pub fn validate_fee(&self, fee: u64) -> VaultResult<()> {
        if fee == 0 {
            return Err(VaultError::Validation("Fee must be positive".to_string()));
        }
        if fee > MAX_FEE_SATS {
            return Err(VaultError::Validation(format!(
                "Fee {} exceeds the limit of {} sats",
                fee, MAX_FEE_SATS
            )));
        }
        Ok(())
    }

    /// Invoices, genesis strings and consignments arrive as opaque text.
    pub fn validate_encoded(&self, what: &str, input: &str) -> VaultResult<()> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(VaultError::Validation(format!("{} cannot be empty", what)));
        }
        if trimmed.len() > MAX_ENCODED_INPUT {
            return Err(VaultError::Validation(format!("{} too long", what)));
        }
        if trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(VaultError::Validation(format!(
                "{} contains whitespace or control characters",
                what
            )));
        }
        Ok(())
    }

    pub fn validate_password(&self, password: &str) -> VaultResult<()> {
        if password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(VaultError::Validation(format!(
                "Password must be at least {} characters",
                MIN_PASSWORD_LENGTH
            )));
        }

        if password.len() > 256 {
            return Err(VaultError::Validation("Password too long".to_string()));
        }

        if password.trim().is_empty() {
            return Err(VaultError::Validation(
                "Password cannot be blank".to_string(),
            ));
        }

        Ok(())
    }

    /// Merchant and purpose texts travel inside invoices and end up on the
    /// payer's screen, so markup and script payloads are refused.
    pub fn validate_free_text(&self, what: &str, text: &str) -> VaultResult<()> {
        if text.chars().count() > MAX_FREE_TEXT {
            return Err(VaultError::Validation(format!("{} too long", what)));
        }
        if text.chars().any(char::is_control) {
            return Err(VaultError::Validation(format!(
                "{} contains control characters",
                what
            )));
        }

        let lowered = text.to_lowercase();
        if self
            .malicious_patterns
            .iter()
            .any(|pattern| pattern.is_match(&lowered))
        {
            return Err(VaultError::Validation(format!(
                "{} contains potentially malicious content",
                what
            )));
        }

        Ok(())
    }
}
