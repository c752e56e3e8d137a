//! Typed views over raw configuration strings.
//!
//! Remote stores only hold strings. Typed accessors are pure parse
//! functions: a value that does not parse yields `None`, never an error.

use std::str::FromStr;

/// Parse a raw value into `T`, yielding `None` on any parse failure.
pub fn parse<T: FromStr>(raw: &str) -> Option<T> {
    raw.parse().ok()
}

/// Parse a boolean, accepting `true` and `false` in any case.
///
/// Anything else is treated as unparseable rather than as `false`.
pub fn parse_bool(raw: &str) -> Option<bool> {
    if raw.eq_ignore_ascii_case("true") {
        Some(true)
    } else if raw.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_parsing() {
        assert_eq!(parse::<i32>("10"), Some(10));
        assert_eq!(parse::<i64>("9223372036854775807"), Some(i64::MAX));
        assert_eq!(parse::<f64>("2.5"), Some(2.5));
        assert_eq!(parse::<f32>("0.5"), Some(0.5f32));
    }

    #[test]
    fn test_non_numeric_yields_absent() {
        assert_eq!(parse::<i32>("ten"), None);
        assert_eq!(parse::<i32>(""), None);
        assert_eq!(parse::<f64>("1.2.3"), None);
    }

    #[test]
    fn test_bool_parsing() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("False"), Some(false));
        assert_eq!(parse_bool("yes"), None);
        assert_eq!(parse_bool("1"), None);
        assert_eq!(parse_bool(""), None);
    }
}
