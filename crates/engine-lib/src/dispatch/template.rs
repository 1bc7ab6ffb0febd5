//! `{{placeholder}}` substitution for notification messages

use std::collections::BTreeMap;

/// Replace every `{{key}}` with its value from `context`.
///
/// Whitespace inside the braces is ignored. Unknown keys and unterminated
/// braces are left in the output untouched.
pub fn render(template: &str, context: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];

        let Some(close) = after_open.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };

        let key = after_open[..close].trim();
        match context.get(key) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[open..open + 2 + close + 2]),
        }
        rest = &after_open[close + 2..];
    }

    out.push_str(rest);
    out
}

/// Human-friendly rendering of a numeric value
pub fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        format!("{value:.2}")
    }
}
