use bigdecimal::BigDecimal;
use std::fmt;
use uuid::Uuid;

/// `NUMERIC(18,2)` leaves 16 digits before the point.
pub const VALUE_MAX_INTEGER_DIGITS: u64 = 16;
/// Fractional digits kept by the `value` column.
pub const VALUE_SCALE: i64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub type ValidationResult = Result<(), ValidationError>;

pub fn validate_account_id(field: &'static str, id: &Uuid) -> ValidationResult {
    if id.is_nil() {
        return Err(ValidationError::new(field, "must be a non-nil UUID"));
    }

    Ok(())
}

pub fn validate_positive_value(value: &BigDecimal) -> ValidationResult {
    if value <= &BigDecimal::from(0) {
        return Err(ValidationError::new("value", "must be greater than zero"));
    }

    Ok(())
}

/// Rejects values the `NUMERIC(18,2)` column cannot hold exactly. Trailing
/// zeros past the second decimal place are accepted.
pub fn validate_value_precision(value: &BigDecimal) -> ValidationResult {
    if value.with_scale(VALUE_SCALE) != *value {
        return Err(ValidationError::new(
            "value",
            format!("must have at most {} decimal places", VALUE_SCALE),
        ));
    }

    let integer_digits = value.with_scale(0).abs().digits();
    if integer_digits > VALUE_MAX_INTEGER_DIGITS {
        return Err(ValidationError::new(
            "value",
            format!("must have at most {} integer digits", VALUE_MAX_INTEGER_DIGITS),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn decimal(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).expect("valid decimal")
    }

    #[test]
    fn validates_account_id() {
        assert!(validate_account_id("sourceAccountId", &Uuid::new_v4()).is_ok());

        let err = validate_account_id("sourceAccountId", &Uuid::nil()).unwrap_err();
        assert_eq!(err.field, "sourceAccountId");
    }

    #[test]
    fn validates_positive_value() {
        assert!(validate_positive_value(&decimal("0.01")).is_ok());
        assert!(validate_positive_value(&decimal("0")).is_err());
        assert!(validate_positive_value(&decimal("-5")).is_err());
    }

    #[test]
    fn validates_value_precision() {
        assert!(validate_value_precision(&decimal("120.50")).is_ok());
        assert!(validate_value_precision(&decimal("9999999999999999.99")).is_ok());
        assert!(validate_value_precision(&decimal("1.500")).is_ok());
        assert!(validate_value_precision(&decimal("10000000000000000")).is_err());
    }

    #[test]
    fn rejects_sub_cent_values() {
        for raw in ["0.004", "0.005", "10.129"] {
            let err = validate_value_precision(&decimal(raw)).unwrap_err();
            assert_eq!(err.field, "value");
            assert_eq!(err.message, "must have at most 2 decimal places");
        }
    }
}
