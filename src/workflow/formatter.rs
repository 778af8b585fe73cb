//! Response formatting for Vietnamese sellers.
//!
//! Normalizes the assistant's text before it is persisted and streamed:
//! thousands grouped with dots (`1.000.000`), decimal commas in
//! percentages (`15,5%`), currency spelled `VND`, and an explicit phrase
//! for empty results.
//!
//! Grouping is deliberately conservative: only digit runs of five or
//! more (or any number carrying a currency suffix) are regrouped, so
//! years and identifiers survive untouched.

use regex::Regex;
use std::sync::OnceLock;

pub const EMPTY_RESULT_REPLY: &str = "Không tìm thấy dữ liệu phù hợp với yêu cầu của bạn.";

/// Digit runs this long or longer are regrouped outside currency context.
const PLAIN_GROUPING_MIN_DIGITS: usize = 5;

fn percent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)\.(\d+)\s*%").expect("static regex"))
}

fn currency_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // đ is a Vietnamese letter too; the word boundary keeps "đơn hàng"
    // out of currency matches.
    RE.get_or_init(|| Regex::new(r"(\d[\d.,]*)\s*(?:₫|VND\b|vnd\b|đ\b)").expect("static regex"))
}

fn digits_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("static regex"))
}

/// Insert a dot every three digits from the right: `1234567` → `1.234.567`.
fn group_digits(digits: &str) -> String {
    let len = digits.len();
    let mut grouped = String::with_capacity(len + len / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(c);
    }
    grouped
}

/// Normalize one numeric token into dot-grouped, comma-decimal form.
/// Tokens that do not look like a plain or English-formatted number are
/// returned unchanged.
fn format_numeric_token(token: &str) -> String {
    let (integer, decimal) = match token.split_once('.') {
        // A short tail after the only dot reads as decimals.
        Some((int_part, dec_part))
            if dec_part.len() <= 2 && !int_part.contains('.') && dec_part.chars().all(|c| c.is_ascii_digit()) =>
        {
            (int_part.to_string(), Some(dec_part.to_string()))
        }
        Some(_) => return token.to_string(),
        None => (token.to_string(), None),
    };

    let plain: String = integer.replace(',', "");
    if !plain.chars().all(|c| c.is_ascii_digit()) || plain.is_empty() {
        return token.to_string();
    }

    let mut formatted = group_digits(&plain);
    if let Some(decimal) = decimal {
        let trimmed = decimal.trim_end_matches('0');
        if !trimmed.is_empty() {
            formatted.push(',');
            formatted.push_str(trimmed);
        }
    }
    formatted
}

/// Format a number for display: `1234567.0` → `1.234.567`.
pub fn format_number(value: f64) -> String {
    let negative = value < 0.0;
    let abs = value.abs();
    let formatted = if abs.fract() == 0.0 {
        group_digits(&format!("{}", abs as i64))
    } else {
        format_numeric_token(&format!("{abs:.2}"))
    };
    if negative {
        format!("-{formatted}")
    } else {
        formatted
    }
}

/// `1234567.0` → `1.234.567 VND`.
pub fn format_currency(value: f64) -> String {
    format!("{} VND", format_number(value))
}

/// `15.5` → `15,5%`; whole percentages drop the decimal.
pub fn format_percent(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}%", value as i64)
    } else {
        format!("{:.1}%", value).replace('.', ",")
    }
}

/// Normalize an assistant response. Empty input becomes the explicit
/// empty-result phrase.
pub fn normalize_response(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return EMPTY_RESULT_REPLY.to_string();
    }

    // Decimal-point percentages → decimal-comma.
    let text = percent_re().replace_all(trimmed, "$1,$2%");

    // Currency suffixes → formatted number + " VND".
    let text = currency_re()
        .replace_all(&text, |caps: &regex::Captures<'_>| {
            format!("{} VND", format_numeric_token(&caps[1]))
        })
        .into_owned();

    // Long plain digit runs → dot grouping, skipping dates and already
    // grouped or decimal numbers (their runs are short or adjacent to
    // separators).
    let mut output = String::with_capacity(text.len());
    let mut cursor = 0;
    for found in digits_re().find_iter(&text) {
        output.push_str(&text[cursor..found.start()]);
        let run = found.as_str();
        let before = text[..found.start()].chars().next_back();
        let after = text[found.end()..].chars().next();
        let isolated = !matches!(before, Some('.' | ',' | '-' | '/'))
            && !matches!(after, Some('.' | ',' | '-' | '/' | '%'));
        if isolated && run.len() >= PLAIN_GROUPING_MIN_DIGITS {
            output.push_str(&group_digits(run));
        } else {
            output.push_str(run);
        }
        cursor = found.end();
    }
    output.push_str(&text[cursor..]);
    output
}
