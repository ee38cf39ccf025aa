//! `%(NAME)` command-template expansion over a string-keyed variable map
//! (spec.md C8).

use std::collections::BTreeMap;

use crate::error::{MountError, Result};

/// The variable map consumed by [`expand`] (spec.md section 3).
pub type VarMap = BTreeMap<String, String>;

/// One parsed placeholder form found while expanding a template.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Var {
        name: String,
        before: Option<String>,
        after: Option<String>,
    },
}

/// Parse `template` into a sequence of literal and placeholder tokens,
/// collecting any syntax errors rather than failing on the first one.
fn parse(template: &str, errors: &mut Vec<String>) -> Vec<Token> {
    let mut tokens = Vec::new();
    let bytes = template.as_bytes();
    let mut literal = String::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' && bytes.get(i + 1) == Some(&b'(') {
            if let Some(close) = find_matching_paren(template, i + 1) {
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                let inner = &template[i + 2..close];
                match parse_placeholder(inner) {
                    Ok(token) => tokens.push(token),
                    Err(e) => errors.push(e),
                }
                i = close + 1;
                continue;
            } else {
                errors.push(format!("unterminated placeholder starting at byte {i}"));
                literal.push('%');
                i += 1;
                continue;
            }
        }
        literal.push(bytes[i] as char);
        i += 1;
    }

    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }

    tokens
}

fn find_matching_paren(s: &str, open_idx: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut depth = 0i32;
    let mut in_quotes = false;
    let mut i = open_idx;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => in_quotes = !in_quotes,
            b'(' if !in_quotes => depth += 1,
            b')' if !in_quotes => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Parse the contents of a `%(...)` placeholder: either a bare `NAME`, or
/// `before="..." NAME` / `after="..." NAME`.
fn parse_placeholder(inner: &str) -> std::result::Result<Token, String> {
    let inner = inner.trim();

    for (keyword, make) in [
        ("before=", Affix::Before as fn(String) -> Affix),
        ("after=", Affix::After as fn(String) -> Affix),
    ] {
        if let Some(rest) = inner.strip_prefix(keyword) {
            let rest = rest.trim_start();
            if !rest.starts_with('"') {
                return Err(format!("expected quoted string after '{keyword}' in '%({inner})'"));
            }
            let close_quote = rest[1..]
                .find('"')
                .ok_or_else(|| format!("unterminated quoted string in '%({inner})'"))?;
            let affix_text = rest[1..1 + close_quote].to_string();
            let name = rest[2 + close_quote..].trim();
            if name.is_empty() {
                return Err(format!("missing variable name in '%({inner})'"));
            }
            return Ok(match make(affix_text) {
                Affix::Before(text) => Token::Var {
                    name: name.to_string(),
                    before: Some(text),
                    after: None,
                },
                Affix::After(text) => Token::Var {
                    name: name.to_string(),
                    before: None,
                    after: Some(text),
                },
            });
        }
    }

    if inner.is_empty() {
        return Err("empty placeholder '%()'".to_string());
    }

    Ok(Token::Var {
        name: inner.to_string(),
        before: None,
        after: None,
    })
}

enum Affix {
    Before(String),
    After(String),
}

/// Expand `template` against `map`. Missing or empty variables expand to the
/// empty string; if a `before=`/`after=` affix is present and the variable's
/// value is empty, the affix itself is also omitted.
pub fn expand(template: &str, map: &VarMap) -> Result<String> {
    let mut errors = Vec::new();
    let tokens = parse(template, &mut errors);
    if !errors.is_empty() {
        return Err(MountError::TemplateExpand(errors.join("; ")));
    }

    let mut out = String::new();
    for token in tokens {
        match token {
            Token::Literal(s) => out.push_str(&s),
            Token::Var { name, before, after } => {
                let value = map.get(&name).map(String::as_str).unwrap_or("");
                if value.is_empty() {
                    continue;
                }
                if let Some(before) = before {
                    out.push_str(&before);
                }
                out.push_str(value);
                if let Some(after) = after {
                    out.push_str(&after);
                }
            }
        }
    }
    Ok(out)
}

/// Build a process argument vector by expanding each template element.
pub fn arglist_build(template_sequence: &[String], map: &VarMap) -> Result<Vec<String>> {
    template_sequence.iter().map(|t| expand(t, map)).collect()
}
