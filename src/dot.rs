//! Small helpers for hand-written DOT output. Witness executions carry
//! model-dependent labels and colors, which is beyond what a structural
//! graph printer can do, so the emitters build the text directly.

use std::fmt::Write;

/// Escape a label for use inside a double-quoted DOT string.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\l"),
            c => out.push(c),
        }
    }
    out
}

/// Emit a `[k="v", ...]` attribute list. Empty values are skipped.
pub fn emit_kvs(out: &mut String, kvs: &[(&str, &str)]) {
    let mut first = true;
    out.push('[');
    for (k, v) in kvs {
        if v.is_empty() {
            continue;
        }
        if !first {
            out.push_str(", ");
        }
        first = false;
        let _ = write!(out, "{k}=\"{}\"", escape(v));
    }
    out.push(']');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_quotes_and_newlines() {
        assert_eq!(escape("a\"b\nc"), "a\\\"b\\lc");
    }

    #[test]
    fn skips_empty_values() {
        let mut s = String::new();
        emit_kvs(&mut s, &[("label", "x"), ("color", "")]);
        assert_eq!(s, "[label=\"x\"]");
    }
}
