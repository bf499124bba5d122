//! Line-level YAML helpers. These inspect and edit single lines so that
//! comments, ordering and formatting of user-maintained files survive untouched.
//! None of them fail: callers get a presence/absence answer.

/// Drops a UTF-8 byte-order mark some editors put before the first line.
fn strip_bom(line: &str) -> &str {
    line.strip_prefix('\u{feff}').unwrap_or(line)
}

pub fn is_blank_or_comment(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

pub fn leading_space_count(line: &str) -> usize {
    line.chars().take_while(|ch| *ch == ' ' || *ch == '\t').count()
}

/// Returns the indent of `line` if it is a `key:` mapping line for `key`,
/// tolerating whitespace before the colon.
pub fn match_key_line(line: &str, key: &str) -> Option<usize> {
    let line = strip_bom(line);
    if is_blank_or_comment(line) {
        return None;
    }
    let indent = leading_space_count(line);
    let rest = &line[indent..];
    let after_key = rest.strip_prefix(key)?;
    let after_ws = after_key.trim_start_matches([' ', '\t']);
    if !after_ws.starts_with(':') {
        return None;
    }
    Some(indent)
}

/// True when `content` has a top-level (column zero) `key:` line.
pub fn has_top_level_block(content: &str, key: &str) -> bool {
    content
        .lines()
        .any(|line| match_key_line(line, key) == Some(0))
}

/// Splits a top-level `key: value` line into its key and unquoted value.
pub fn parse_scalar_line(line: &str) -> Option<(&str, String)> {
    let line = strip_bom(line);
    if is_blank_or_comment(line) || leading_space_count(line) != 0 {
        return None;
    }
    let (key, raw_value) = line.split_once(':')?;
    let key = key.trim_end();
    if key.is_empty() {
        return None;
    }
    Some((key, unquote(strip_trailing_comment(raw_value.trim()))))
}

fn strip_trailing_comment(value: &str) -> &str {
    if value.starts_with('"') || value.starts_with('\'') {
        return value;
    }
    match value.find(" #") {
        Some(idx) => value[..idx].trim_end(),
        None => value,
    }
}

fn unquote(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        return value[1..value.len() - 1].replace("''", "'");
    }
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        let mut out = String::new();
        let mut chars = value[1..value.len() - 1].chars();
        while let Some(ch) = chars.next() {
            if ch != '\\' {
                out.push(ch);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        }
        return out;
    }
    value.to_string()
}

pub fn double_quoted(value: &str) -> String {
    let mut inner = String::new();
    for ch in value.chars() {
        match ch {
            '\\' => inner.push_str("\\\\"),
            '"' => inner.push_str("\\\""),
            '\n' => inner.push_str("\\n"),
            '\r' => inner.push_str("\\r"),
            '\t' => inner.push_str("\\t"),
            _ => inner.push(ch),
        }
    }
    format!("\"{inner}\"")
}

/// Appends `fragment` to `content`, separated by a blank line, keeping the
/// existing text byte-for-byte.
pub fn append_fragment(content: &str, fragment: &str) -> String {
    let mut out = content.to_string();
    if !out.is_empty() {
        if !out.ends_with('\n') {
            out.push('\n');
        }
        if !out.ends_with("\n\n") {
            out.push('\n');
        }
    }
    out.push_str(fragment);
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}
