//! Source transforms applied before `Eval`.

use std::borrow::Cow;

use ferry_core::{Preprocess, ScriptError};

/// Removes type annotations from `let` bindings: `let n: Int = 1` runs as
/// `let n = 1`. Annotations are erased, never checked.
#[derive(Debug, Default, Clone, Copy)]
pub struct StripTypeAnnotations;

impl Preprocess for StripTypeAnnotations {
    fn preprocess<'a>(&self, source: &'a str) -> Result<Cow<'a, str>, ScriptError> {
        let mut out = String::with_capacity(source.len());
        let mut changed = false;
        let mut rest = source;

        while let Some((before, annotation, after)) = next_annotation(rest) {
            out.push_str(before);
            if annotation.contains('\n') {
                return Err(ScriptError::Syntax(
                    "type annotation must end with '=' on the same line".to_string(),
                ));
            }
            // Keep the spacing in front of `=`.
            out.push_str(&annotation[annotation.trim_end().len()..]);
            changed = true;
            rest = after;
        }

        if !changed {
            return Ok(Cow::Borrowed(source));
        }
        out.push_str(rest);
        Ok(Cow::Owned(out))
    }
}

/// Find the first `let name: Type` annotation outside string literals and
/// comments. Returns the text before the annotation, the annotation itself
/// (from `:` up to the `=`) and the text from the `=` on.
fn next_annotation(source: &str) -> Option<(&str, &str, &str)> {
    let bytes = source.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'"' | b'\'') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote && bytes[i] != b'\n' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'l' if source[i..].starts_with("let")
                && (i == 0 || !is_word(bytes[i - 1]))
                && bytes.get(i + 3).is_some_and(|b| b.is_ascii_whitespace()) =>
            {
                let mut j = i + 3;
                while j < bytes.len() && (bytes[j] == b' ' || bytes[j] == b'\t') {
                    j += 1;
                }
                let name_start = j;
                while j < bytes.len() && is_word(bytes[j]) {
                    j += 1;
                }
                let name_end = j;
                while j < bytes.len() && (bytes[j] == b' ' || bytes[j] == b'\t') {
                    j += 1;
                }
                if name_end > name_start && bytes.get(j) == Some(&b':') {
                    let colon = j;
                    let equals = source[colon..].find('=').map(|offset| colon + offset)?;
                    return Some((
                        &source[..name_end],
                        &source[colon..equals],
                        &source[equals..],
                    ));
                }
                i = j.max(i + 1);
            }
            _ => i += 1,
        }
    }
    None
}

fn is_word(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}
