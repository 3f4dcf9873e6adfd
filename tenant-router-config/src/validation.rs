// Settings validation

use crate::{ConfigError, Result};

/// Implemented by settings types that have rules beyond what serde checks.
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// Reusable validation rules.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate that a value is not empty
    pub fn not_empty(value: &str, field: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(ConfigError::validation(format!("{} cannot be empty", field)));
        }
        Ok(())
    }

    /// Validate that a value does not contain `forbidden`
    pub fn excludes(value: &str, forbidden: char, field: &str) -> Result<()> {
        if value.contains(forbidden) {
            return Err(ConfigError::validation(format!(
                "{} must not contain '{}' (got {:?})",
                field, forbidden, value
            )));
        }
        Ok(())
    }

    /// Validate that a number is within an inclusive range
    pub fn in_range<T: PartialOrd + std::fmt::Display>(
        value: T,
        min: T,
        max: T,
        field: &str,
    ) -> Result<()> {
        if value < min || value > max {
            return Err(ConfigError::validation(format!(
                "{} must be between {} and {} (got {})",
                field, min, max, value
            )));
        }
        Ok(())
    }

    /// Validate that a value is in a list of allowed values
    pub fn one_of<T: PartialEq + std::fmt::Debug>(value: &T, allowed: &[T], field: &str) -> Result<()> {
        if !allowed.contains(value) {
            return Err(ConfigError::validation(format!(
                "{} must be one of {:?} (got {:?})",
                field, allowed, value
            )));
        }
        Ok(())
    }

    /// Validate that a value parses as a URL with one of the given schemes
    pub fn is_url(value: &str, schemes: &[&str], field: &str) -> Result<()> {
        let parsed = url::Url::parse(value)
            .map_err(|e| ConfigError::validation(format!("{} must be a valid URL: {}", field, e)))?;

        if !schemes.is_empty() && !schemes.contains(&parsed.scheme()) {
            return Err(ConfigError::validation(format!(
                "{} must use one of the schemes {:?} (got {})",
                field,
                schemes,
                parsed.scheme()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_empty_validation() {
        assert!(ConfigValidator::not_empty("value", "field").is_ok());
        assert!(ConfigValidator::not_empty("", "field").is_err());
        assert!(ConfigValidator::not_empty("   ", "field").is_err());
    }

    #[test]
    fn test_excludes_validation() {
        assert!(ConfigValidator::excludes("svc", '_', "service_name").is_ok());
        assert!(ConfigValidator::excludes("my_svc", '_', "service_name").is_err());
    }

    #[test]
    fn test_range_validation() {
        assert!(ConfigValidator::in_range(50, 1, 10_000, "queue_capacity").is_ok());
        assert!(ConfigValidator::in_range(0, 1, 10_000, "queue_capacity").is_err());
    }

    #[test]
    fn test_one_of_validation() {
        let allowed = ["memory", "redis"];
        assert!(ConfigValidator::one_of(&"redis", &allowed, "backend").is_ok());
        assert!(ConfigValidator::one_of(&"kafka", &allowed, "backend").is_err());
    }

    #[test]
    fn test_url_validation() {
        assert!(ConfigValidator::is_url("redis://localhost:6379", &["redis", "rediss"], "url").is_ok());
        assert!(ConfigValidator::is_url("http://localhost", &["redis"], "url").is_err());
        assert!(ConfigValidator::is_url("localhost", &[], "url").is_err());
    }
}
