//! ---
//! hm_section: "02-specification"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Service specification model and compose file parsing."
//! hm_version: "v0.0.0-prealpha"
//! hm_owner: "tbd"
//! ---
//! Environment files and `$VAR` substitution for compose documents.

use std::path::Path;

use indexmap::IndexMap;

use crate::errors::{Result, SpecError};

/// Read a dotenv file. Values follow dotenv syntax: quoting, escapes, inline
/// comments and `${VAR}` references to earlier keys or the process environment.
pub fn read_env_file(path: &Path) -> Result<IndexMap<String, String>> {
    let mut vars = IndexMap::new();
    for item in dotenvy::from_path_iter(path).map_err(|err| env_file_error(path, err))? {
        let (key, value) = item.map_err(|err| env_file_error(path, err))?;
        vars.insert(key, value);
    }
    Ok(vars)
}

fn env_file_error(path: &Path, err: dotenvy::Error) -> SpecError {
    match err {
        dotenvy::Error::Io(source) => SpecError::Read {
            path: path.to_path_buf(),
            source,
        },
        other => SpecError::EnvFile {
            path: path.to_path_buf(),
            source: other,
        },
    }
}

/// Substitute `$VAR`, `${VAR}` and `${VAR:-default}` using `lookup`.
/// Unknown variables expand to the empty string and `$$` yields a literal `$`.
pub fn expand<F>(content: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(content.len());
    let mut chars = content.char_indices().peekable();

    while let Some((_, ch)) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }
        match chars.peek().copied() {
            Some((_, '$')) => {
                chars.next();
                out.push('$');
            }
            Some((start, '{')) => {
                chars.next();
                let rest = &content[start + 1..];
                match rest.find('}') {
                    Some(end) => {
                        let inner = &rest[..end];
                        out.push_str(&expand_braced(inner, &lookup));
                        // Skip past the closing brace.
                        for _ in 0..inner.chars().count() + 1 {
                            chars.next();
                        }
                    }
                    None => out.push_str("${"),
                }
            }
            Some((start, next)) if is_name_start(next) => {
                let mut end = start;
                while let Some((index, c)) = chars.peek().copied() {
                    if !is_name_char(c) {
                        break;
                    }
                    end = index + c.len_utf8();
                    chars.next();
                }
                out.push_str(&lookup(&content[start..end]).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }
    out
}

fn expand_braced<F>(inner: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if let Some((name, default)) = inner.split_once(":-") {
        return lookup(name)
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| default.to_string());
    }
    if let Some((name, default)) = inner.split_once('-') {
        return lookup(name).unwrap_or_else(|| default.to_string());
    }
    lookup(inner).unwrap_or_default()
}

fn is_name_start(ch: char) -> bool {
    ch == '_' || ch.is_ascii_alphabetic()
}

fn is_name_char(ch: char) -> bool {
    ch == '_' || ch.is_ascii_alphanumeric()
}
