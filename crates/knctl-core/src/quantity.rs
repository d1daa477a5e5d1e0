//! Resource quantity validation for `--request` / `--limit` style flags

use std::sync::OnceLock;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use regex::Regex;

use crate::error::{CoreError, Result};

/// Kubernetes quantity grammar: signed decimal number with an optional
/// binary suffix, decimal suffix or exponent
fn quantity_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^[+-]?([0-9]+(\.[0-9]*)?|\.[0-9]+)(Ki|Mi|Gi|Ti|Pi|Ei|n|u|m|k|M|G|T|P|E|[eE][+-]?[0-9]+)?$")
            .expect("quantity regex is valid")
    })
}

/// Parse a user supplied quantity such as `250m`, `1.5` or `64Mi`
pub fn parse_quantity(flag: &str, value: &str) -> Result<Quantity> {
    let value = value.trim();
    if value.is_empty() || !quantity_regex().is_match(value) {
        return Err(CoreError::InvalidQuantity {
            flag: format!("--{flag}"),
            value: value.to_string(),
        });
    }
    Ok(Quantity(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_quantities() {
        for q in ["1", "250m", "0.5", ".5", "64Mi", "1Gi", "1e3", "2k", "+1"] {
            assert_eq!(parse_quantity("limit-cpu", q).unwrap().0, q, "{q}");
        }
    }

    #[test]
    fn test_invalid_quantities() {
        for q in ["", "abc", "12345r", "1.2.3", "Mi", "1 Gi"] {
            let err = parse_quantity("limit-memory", q).unwrap_err();
            assert!(err.is_user_input(), "{q}");
        }
    }

    #[test]
    fn test_error_mentions_flag() {
        let err = parse_quantity("request-cpu", "lots").unwrap_err();
        assert_eq!(err.to_string(), "Invalid quantity 'lots' for --request-cpu");
    }
}
