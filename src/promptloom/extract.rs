//! Parsing of LM-emitted Rhai source.
//!
//! The LM returns code wrapped in markdown fences more often than not, and
//! sometimes returns prose that is not code at all. This module cleans the
//! raw completion, canonicalizes the principal function name, validates the
//! result against the script engine, and recovers a descriptor for every
//! top-level function: its name, argument names, doc-comment text, and the
//! exact source span covering the definition (doc comments included).
//!
//! A completion that does not compile yields an *empty* descriptor list —
//! the message is then recorded as producing no skill, which is not an
//! error for terminal flows.

use rhai::Engine;

/// Descriptor of one top-level function found in synthesized source.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    /// The function's code-level name.
    pub script_name: String,
    /// Argument names, in order.
    pub args: Vec<String>,
    /// Text of the `///` doc-comment block, prefixes stripped. Empty when
    /// the function carries no doc comment.
    pub docstring: String,
    /// The exact source span of the definition, doc comments included.
    pub code: String,
}

/// Strip leading/trailing blank lines, then one leading markdown fence
/// (```` ``` ````, ```` ```rhai ````, ```` ```rust ```` or
/// ```` ```python ````) and one trailing ```` ``` ````.
pub fn sanitize_code(raw: &str) -> String {
    let mut lines: Vec<&str> = raw.lines().collect();

    while lines.first().map_or(false, |l| l.trim().is_empty()) {
        lines.remove(0);
    }
    while lines.last().map_or(false, |l| l.trim().is_empty()) {
        lines.pop();
    }

    if lines.first().map_or(false, |l| {
        let t = l.trim();
        t == "```" || t == "```rhai" || t == "```rust" || t == "```python"
    }) {
        lines.remove(0);
    }
    if lines.last().map_or(false, |l| {
        let t = l.trim();
        t == "```" || t == "```rhai" || t == "```rust" || t == "```python"
    }) {
        lines.pop();
    }

    lines.join("\n")
}

/// Replace the first occurrence of the identifier `target` (identifier
/// boundaries respected, so `encode` is never touched when renaming `code`)
/// with `replacement`. Returns the input unchanged when no occurrence
/// exists.
pub fn rename_first_identifier(code: &str, target: &str, replacement: &str) -> String {
    let bytes = code.as_bytes();
    let mut search_from = 0;

    while let Some(found) = code[search_from..].find(target) {
        let start = search_from + found;
        let end = start + target.len();
        let boundary_before = start == 0 || !is_ident_byte(bytes[start - 1]);
        let boundary_after = end == code.len() || !is_ident_byte(bytes[end]);
        if boundary_before && boundary_after {
            let mut out = String::with_capacity(code.len() + replacement.len());
            out.push_str(&code[..start]);
            out.push_str(replacement);
            out.push_str(&code[end..]);
            return out;
        }
        search_from = start + 1;
    }
    code.to_string()
}

fn is_ident_byte(b: u8) -> bool {
    b == b'_' || b.is_ascii_alphanumeric()
}

/// The sentence appended to every synthesized skill's docstring, tying it
/// back to the message it was generated for.
pub fn docstring_addendum(mid: u64) -> String {
    format!(
        "This function was generated to fulfill the intent of the user message with message id {}.",
        mid
    )
}

/// Return a copy of `def` with the message-id addendum appended to both the
/// docstring and the doc-comment block of the source span.
pub fn with_docstring_addendum(def: &FunctionDef, mid: u64) -> FunctionDef {
    let addendum = docstring_addendum(mid);
    let docstring = if def.docstring.is_empty() {
        addendum.clone()
    } else {
        format!("{}\n\n{}", def.docstring, addendum)
    };

    let mut out_lines: Vec<String> = Vec::new();
    let mut inserted = false;
    for line in def.code.lines() {
        let trimmed = line.trim_start();
        if !inserted && (trimmed.starts_with("fn ") || trimmed.starts_with("private fn ")) {
            if !def.docstring.is_empty() {
                out_lines.push("///".to_string());
            }
            out_lines.push(format!("/// {}", addendum));
            inserted = true;
        }
        out_lines.push(line.to_string());
    }

    FunctionDef {
        script_name: def.script_name.clone(),
        args: def.args.clone(),
        docstring,
        code: out_lines.join("\n"),
    }
}

/// Compile-validate `code` and return a descriptor for every top-level
/// function, in source order. A parse failure yields an empty list.
pub fn extract_function_definitions(engine: &Engine, code: &str) -> Vec<FunctionDef> {
    if engine.compile(code).is_err() {
        return Vec::new();
    }
    scan_top_level_functions(code)
}

/// Find `(first_line, last_line)` spans of functions defined at brace depth
/// zero, tracking strings, character literals, and comments so that braces
/// inside them do not skew the depth count. Nested functions never start at
/// depth zero and are therefore ignored.
fn scan_top_level_functions(code: &str) -> Vec<FunctionDef> {
    let lines: Vec<&str> = code.lines().collect();
    let mut spans: Vec<(usize, usize)> = Vec::new();

    let mut depth: i64 = 0;
    let mut in_block_comment = false;
    let mut in_backtick_string = false;
    let mut current_start: Option<usize> = None;

    for (line_no, line) in lines.iter().enumerate() {
        if !in_block_comment
            && !in_backtick_string
            && depth == 0
            && current_start.is_none()
            && is_fn_header(line)
        {
            current_start = Some(line_no);
        }

        let mut chars = line.chars().peekable();
        let mut in_quote_string = false;
        while let Some(c) = chars.next() {
            if in_block_comment {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    in_block_comment = false;
                }
                continue;
            }
            if in_backtick_string {
                if c == '`' {
                    in_backtick_string = false;
                }
                continue;
            }
            if in_quote_string {
                if c == '\\' {
                    chars.next();
                } else if c == '"' {
                    in_quote_string = false;
                }
                continue;
            }
            match c {
                '/' => match chars.peek() {
                    Some('/') => break,
                    Some('*') => {
                        chars.next();
                        in_block_comment = true;
                    }
                    _ => {}
                },
                '"' => in_quote_string = true,
                '`' => in_backtick_string = true,
                '\'' => {
                    // character literal
                    while let Some(next) = chars.next() {
                        if next == '\\' {
                            chars.next();
                        } else if next == '\'' {
                            break;
                        }
                    }
                }
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(start) = current_start.take() {
                            spans.push((start, line_no));
                        }
                    }
                }
                _ => {}
            }
        }
    }

    spans
        .into_iter()
        .filter_map(|(start, end)| build_function_def(&lines, start, end))
        .collect()
}

fn is_fn_header(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("fn ") || trimmed.starts_with("private fn ")
}

fn build_function_def(lines: &[&str], start: usize, end: usize) -> Option<FunctionDef> {
    // The doc-comment block is the contiguous run of `///` lines directly
    // above the header; it belongs to the span.
    let mut doc_start = start;
    while doc_start > 0 && lines[doc_start - 1].trim_start().starts_with("///") {
        doc_start -= 1;
    }
    let docstring = lines[doc_start..start]
        .iter()
        .map(|l| strip_doc_prefix(l))
        .collect::<Vec<String>>()
        .join("\n");

    // Parse the signature out of the header (which may wrap across lines).
    let header = lines[start..=end].join("\n");
    let after_kw = header.trim_start();
    let after_kw = match after_kw.strip_prefix("private") {
        Some(rest) => rest.trim_start(),
        None => after_kw,
    };
    let after_kw = after_kw.strip_prefix("fn")?.trim_start();
    let open_paren = after_kw.find('(')?;
    let script_name = after_kw[..open_paren].trim().to_string();
    if script_name.is_empty() {
        return None;
    }

    let mut paren_depth = 0;
    let mut args_src = String::new();
    for c in after_kw[open_paren..].chars() {
        match c {
            '(' => {
                paren_depth += 1;
                if paren_depth == 1 {
                    continue;
                }
            }
            ')' => {
                paren_depth -= 1;
                if paren_depth == 0 {
                    break;
                }
            }
            _ => {}
        }
        args_src.push(c);
    }
    let args: Vec<String> = args_src
        .split(',')
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect();

    Some(FunctionDef {
        script_name,
        args,
        docstring,
        code: lines[doc_start..=end].join("\n"),
    })
}

fn strip_doc_prefix(line: &str) -> String {
    let trimmed = line.trim_start();
    let trimmed = trimmed.strip_prefix("///").unwrap_or(trimmed);
    trimmed.strip_prefix(' ').unwrap_or(trimmed).to_string()
}
