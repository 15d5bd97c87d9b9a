use anyhow::{Result, bail};
use std::collections::HashMap;
use std::io::{BufRead, Read, Write};

/// Upper bound on a single input line (and therefore on any tag).
pub const MAX_LINE_BYTES: usize = 20 * 1024 * 1024;

/// Substitute `{{KEY}}` tags in one line. Whitespace inside the delimiters
/// is ignored. Tags whose key is not mapped are preserved literally; an
/// unclosed `{{` leaves the remainder of the line untouched. No nesting,
/// no expressions, no escaping.
pub fn render_line(line: &str, params: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };

        let key = after[..end].trim();
        match params.get(key) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    out
}

/// Stream `reader` to `writer`, substituting tags line by line. Line
/// terminators (LF or CRLF) pass through unchanged, as does a final line
/// without one.
pub fn render<R: BufRead, W: Write>(
    mut reader: R,
    writer: &mut W,
    params: &HashMap<String, String>,
) -> Result<()> {
    let mut raw = Vec::new();

    loop {
        raw.clear();
        let n = Read::take(&mut reader, MAX_LINE_BYTES as u64 + 1).read_until(b'\n', &mut raw)?;
        if n == 0 {
            return Ok(());
        }
        if raw.len() > MAX_LINE_BYTES {
            bail!("template line exceeds {} bytes", MAX_LINE_BYTES);
        }

        // Split off the terminator so substitution never touches it.
        let body_len = if raw.ends_with(b"\r\n") {
            raw.len() - 2
        } else if raw.ends_with(b"\n") {
            raw.len() - 1
        } else {
            raw.len()
        };

        let body = String::from_utf8_lossy(&raw[..body_len]);
        writer.write_all(render_line(&body, params).as_bytes())?;
        writer.write_all(&raw[body_len..])?;
    }
}

/// Render a whole in-memory template.
pub fn render_str(source: &str, params: &HashMap<String, String>) -> Result<String> {
    let mut out = Vec::with_capacity(source.len());
    render(source.as_bytes(), &mut out, params)?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}
