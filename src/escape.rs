//! CSS identifier escaping and raw-token to selector conversion.

/// Escapes every character that is not valid in a CSS identifier with a
/// backslash. ASCII alphanumerics, `-`, `_` and characters at or above
/// U+00A0 pass through unchanged.
pub fn escape_css_ident(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || (ch as u32) >= 0xA0 {
            out.push(ch);
        } else {
            out.push('\\');
            out.push(ch);
        }
    }
    out
}

/// Converts a raw token into a CSS selector. Tokens shaped like
/// `[name="value"]` or `[name~="value"]` become attribute selectors with
/// both sides escaped; everything else becomes a class selector.
pub fn to_escaped_selector(raw: &str) -> String {
    if let Some((name, op, value)) = parse_attribute_token(raw) {
        return format!(
            "[{}{}\"{}\"]",
            escape_css_ident(name),
            op,
            escape_css_ident(value)
        );
    }
    format!(".{}", escape_css_ident(raw))
}

fn parse_attribute_token(raw: &str) -> Option<(&str, &str, &str)> {
    let inner = raw.strip_prefix('[')?.strip_suffix(']')?;
    let eq = inner.find('=')?;
    let (name, op) = if eq > 0 && inner.as_bytes()[eq - 1] == b'~' {
        (&inner[..eq - 1], "~=")
    } else {
        (&inner[..eq], "=")
    };
    if name.is_empty() {
        return None;
    }
    let value = inner[eq + 1..].strip_prefix('"')?.strip_suffix('"')?;
    if value.contains('"') {
        return None;
    }
    Some((name, op, value))
}
