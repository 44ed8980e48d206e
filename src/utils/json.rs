/// Removes a surrounding markdown fence such as ```` ```json ... ``` ````.
pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if !s.starts_with("```") {
        return s.to_string();
    }
    let body = s.trim_start_matches("```");
    // Drop the language tag on the opening line, if any.
    let body = match body.find('\n') {
        Some(pos) if body[..pos].trim().chars().all(|c| c.is_ascii_alphanumeric()) => {
            &body[pos + 1..]
        }
        _ => body,
    };
    body.trim_end().trim_end_matches("```").trim().to_string()
}

/// Removes a leading `name =` assignment, as in `book_data = {...}`.
pub fn strip_assignment_prefix<'a>(s: &'a str, name: &str) -> &'a str {
    let trimmed = s.trim_start();
    match trimmed.strip_prefix(name) {
        Some(rest) => match rest.trim_start().strip_prefix('=') {
            Some(value) => value.trim_start(),
            None => s,
        },
        None => s,
    }
}

/// Returns the first balanced `{...}` or `[...]` block in `s`.
///
/// Brackets inside string literals are ignored.
pub fn find_json_block(s: &str) -> Option<&str> {
    let start = s.find(['{', '['])?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in s[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + offset + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}
