//! Locale-ambiguous number parsing.
//!
//! Spreadsheet exports mix `1.234,50`, `1,234.50`, `100.000` and `100,5`.
//! The rules below pick a decimal separator per value and return `None`
//! rather than guessing when the remainder is not a plain number.

use crate::is_blank;

pub const NUMERIC_EPSILON: f64 = 1e-6;

pub fn parse_number(raw: &str) -> Option<f64> {
    if is_blank(raw) {
        return None;
    }
    let text = raw.trim();
    let commas = text.matches(',').count();
    let dots = text.matches('.').count();

    let normalized = match (commas, dots) {
        (0, 0) => text.to_string(),
        (c, d) if c > 0 && d > 0 => {
            let last_comma = text.rfind(',').unwrap_or(0);
            let last_dot = text.rfind('.').unwrap_or(0);
            if last_comma > last_dot {
                text.replace('.', "").replace(',', ".")
            } else {
                text.replace(',', "")
            }
        }
        (1, 0) => text.replace(',', "."),
        (_, 0) => text.replace(',', ""),
        (0, 1) => text.to_string(),
        _ => text.replace('.', ""),
    };

    normalized
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

pub fn numbers_equal(a: &str, b: &str) -> bool {
    match (parse_number(a), parse_number(b)) {
        (Some(x), Some(y)) => (x - y).abs() <= NUMERIC_EPSILON,
        _ => false,
    }
}
