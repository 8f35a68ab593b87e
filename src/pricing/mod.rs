//! Price Parser
//! Mission: Turn heterogeneous numeric price strings into a value + currency.

use serde::{Deserialize, Serialize};

/// Detected currency of a parsed price string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Eur,
    Usd,
    Gbp,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Eur => "EUR",
            Currency::Usd => "USD",
            Currency::Gbp => "GBP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParsedPrice {
    pub value: f64,
    pub currency: Option<Currency>,
}

#[derive(Debug)]
pub enum PriceParseError {
    Empty,
    NoDigits,
    Malformed,
}

impl std::fmt::Display for PriceParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PriceParseError::Empty => write!(f, "empty price string"),
            PriceParseError::NoDigits => write!(f, "no digits found in price string"),
            PriceParseError::Malformed => write!(f, "malformed price string"),
        }
    }
}

impl std::error::Error for PriceParseError {}

/// `1 <= x <= 10_000_000` per spec.
pub fn is_reasonable_price(x: f64) -> bool {
    (1.0..=10_000_000.0).contains(&x)
}

/// Detect currency by scanning for symbols/codes anywhere in the string.
pub fn detect_currency(raw: &str) -> Option<Currency> {
    let upper = raw.to_uppercase();
    if raw.contains('€') || upper.contains("EUR") {
        Some(Currency::Eur)
    } else if raw.contains('$') || upper.contains("USD") {
        Some(Currency::Usd)
    } else if raw.contains('£') || upper.contains("GBP") {
        Some(Currency::Gbp)
    } else {
        None
    }
}

/// Parse a heterogeneous price string like "1 250,50 €", "1.250,50 €",
/// "€ 1,250.50", "1250€", "EUR 1250".
pub fn parse_price(raw: &str) -> Result<ParsedPrice, PriceParseError> {
    if raw.trim().is_empty() {
        return Err(PriceParseError::Empty);
    }

    let currency = detect_currency(raw);

    // Keep digits, '.', ',', whitespace (including nbsp).
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',' || c.is_whitespace() || *c == '\u{a0}')
        .collect();

    // Drop whitespace entirely, it's only ever a thousands separator in EU formatting.
    let no_space: String = cleaned.chars().filter(|c| !c.is_whitespace()).collect();

    if !no_space.chars().any(|c| c.is_ascii_digit()) {
        return Err(PriceParseError::NoDigits);
    }

    let value = parse_numeric(&no_space)?;

    Ok(ParsedPrice { value, currency })
}

/// Decide which of '.' / ',' (if either) is the decimal separator and
/// parse the resulting digit string into an `f64`.
fn parse_numeric(s: &str) -> Result<f64, PriceParseError> {
    let dot_positions: Vec<usize> = s.match_indices('.').map(|(i, _)| i).collect();
    let comma_positions: Vec<usize> = s.match_indices(',').map(|(i, _)| i).collect();

    let decimal_sep: Option<char> = match (dot_positions.len(), comma_positions.len()) {
        (0, 0) => None,
        (0, _) => decimal_if_trailing_short(s, ',', &comma_positions),
        (_, 0) => decimal_if_trailing_short(s, '.', &dot_positions),
        (_, _) => {
            // Both present: the last-occurring separator is decimal.
            let last_dot = *dot_positions.last().unwrap();
            let last_comma = *comma_positions.last().unwrap();
            if last_dot > last_comma {
                Some('.')
            } else {
                Some(',')
            }
        }
    };

    let mut normalized = String::with_capacity(s.len());
    match decimal_sep {
        Some(sep) => {
            // Find the last occurrence of `sep`; everything before (other
            // instances of '.'/',') is a thousands separator and gets
            // dropped, the decimal separator itself becomes '.'.
            let last_idx = s.rfind(sep).unwrap();
            for (i, c) in s.char_indices() {
                if c == '.' || c == ',' {
                    if i == last_idx {
                        normalized.push('.');
                    }
                    // else: thousands separator, drop it
                } else {
                    normalized.push(c);
                }
            }
        }
        None => {
            normalized.push_str(s);
        }
    }

    normalized.parse::<f64>().map_err(|_| PriceParseError::Malformed)
}

/// `,`/`.` is the decimal separator if it appears exactly once and its
/// trailing digit group has <= 2 digits; otherwise it's a thousands sep.
fn decimal_if_trailing_short(s: &str, sep: char, positions: &[usize]) -> Option<char> {
    if positions.len() != 1 {
        return None;
    }
    let pos = positions[0];
    let trailing_digits = s[pos + sep.len_utf8()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .count();
    if trailing_digits <= 2 {
        Some(sep)
    } else {
        None
    }
}

/// Render a parsed price back into a canonical `"1234.56"` string, used by
/// the round-trip law `parse(format(parse(s))) == parse(s)`.
pub fn format_price(p: &ParsedPrice) -> String {
    format!("{:.2}", p.value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_eu_thousands_comma_decimal() {
        let p = parse_price("1 250,50 €").unwrap();
        assert_eq!(p.value, 1250.50);
        assert_eq!(p.currency, Some(Currency::Eur));
    }

    #[test]
    fn parses_eu_dot_thousands_comma_decimal() {
        let p = parse_price("1.250,50 €").unwrap();
        assert_eq!(p.value, 1250.50);
    }

    #[test]
    fn parses_us_comma_thousands_dot_decimal() {
        let p = parse_price("€ 1,250.50").unwrap();
        assert_eq!(p.value, 1250.50);
    }

    #[test]
    fn parses_bare_integer_with_trailing_symbol() {
        let p = parse_price("1250€").unwrap();
        assert_eq!(p.value, 1250.0);
        assert_eq!(p.currency, Some(Currency::Eur));
    }

    #[test]
    fn parses_code_prefixed_integer() {
        let p = parse_price("EUR 1250").unwrap();
        assert_eq!(p.value, 1250.0);
        assert_eq!(p.currency, Some(Currency::Eur));
    }

    #[test]
    fn single_comma_with_long_trailing_group_is_thousands() {
        let p = parse_price("1,250").unwrap();
        assert_eq!(p.value, 1250.0);
    }

    #[test]
    fn single_comma_with_short_trailing_group_is_decimal() {
        let p = parse_price("12,5").unwrap();
        assert_eq!(p.value, 12.5);
    }

    #[test]
    fn detects_usd_and_gbp() {
        assert_eq!(detect_currency("$100"), Some(Currency::Usd));
        assert_eq!(detect_currency("£100"), Some(Currency::Gbp));
        assert_eq!(detect_currency("100 GBP"), Some(Currency::Gbp));
    }

    #[test]
    fn rejects_empty_and_non_numeric() {
        assert!(parse_price("").is_err());
        assert!(parse_price("€ only text").is_err());
    }

    #[test]
    fn reasonable_price_bounds() {
        assert!(is_reasonable_price(1.0));
        assert!(is_reasonable_price(10_000_000.0));
        assert!(!is_reasonable_price(0.5));
        assert!(!is_reasonable_price(10_000_001.0));
    }

    #[test]
    fn round_trip_law_holds() {
        for s in ["1 250,50 €", "1.250,50 €", "€ 1,250.50", "1250€", "EUR 1250"] {
            let p1 = parse_price(s).unwrap();
            let formatted = format_price(&p1);
            let p2 = parse_price(&formatted).unwrap();
            assert!((p1.value - p2.value).abs() < 1e-9, "mismatch for {s}");
        }
    }
}
