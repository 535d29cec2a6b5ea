//! Pulling source code out of free-form model output.

use std::sync::OnceLock;

use regex::Regex;

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_+#.-]*)[^\n]*\n(.*?)```")
            .expect("fence regex is valid")
    })
}

/// Prose openers that are never code.
const PROSE_PREFIXES: &[&str] = &[
    "Here", "This", "The ", "Note:", "I ", "Let me", "---", "Explanation", "Output:",
];

/// Tokens that start a code region.
const CODE_START: &[&str] = &[
    "import ", "from ", "def ", "class ", "#!", "\"\"\"", "'''", "func ", "fn ", "package ",
    "use ", "pub ", "const ", "let ", "var ", "function ", "public ", "private ", "using ",
    "namespace ", "<?php", "#include", "async ", "export ", "interface ", "type ", "struct ",
];

/// Tokens that keep a line in the code region even before it has started.
const CODE_LINE: &[&str] = &[
    "#", "import", "from", "def", "class", "if", "for", "while", "try", "with", "@", "return",
    "print", "//", "}", "{",
];

/// A fenced block: (language tag, body).
pub fn fenced_blocks(text: &str) -> Vec<(String, String)> {
    fence_re()
        .captures_iter(text)
        .map(|c| {
            (
                c.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
                c.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
            )
        })
        .collect()
}

fn tag_matches(tag: &str, language: &str) -> bool {
    if tag.is_empty() {
        return false;
    }
    if tag.eq_ignore_ascii_case(language) {
        return true;
    }
    match (
        cs_core::language::normalize(tag),
        cs_core::language::normalize(language),
    ) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Extract code from a model response.
///
/// Tries, in order: a fenced block tagged with `language` (aliases
/// accepted), any non-empty fenced block, a line heuristic over
/// code-indicative prefixes, and finally the trimmed response.
pub fn extract_code(response: &str, language: &str) -> String {
    let blocks = fenced_blocks(response);

    if let Some((_, body)) = blocks
        .iter()
        .find(|(tag, body)| tag_matches(tag, language) && !body.trim().is_empty())
    {
        return body.trim().to_string();
    }
    if let Some((_, body)) = blocks.iter().find(|(_, body)| !body.trim().is_empty()) {
        return body.trim().to_string();
    }

    let heuristic = heuristic_code(response);
    if !heuristic.trim().is_empty() {
        return heuristic;
    }
    response.trim().to_string()
}

fn heuristic_code(response: &str) -> String {
    let mut code_lines = Vec::new();
    let mut in_code = false;
    for line in response.trim().lines() {
        let trimmed = line.trim_start();
        if PROSE_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
            continue;
        }
        if CODE_START.iter().any(|p| trimmed.starts_with(p)) {
            in_code = true;
        }
        if in_code || CODE_LINE.iter().any(|p| trimmed.starts_with(p)) {
            code_lines.push(line);
            in_code = true;
        }
    }
    code_lines.join("\n")
}

/// Slice from the first `{` to the last `}`, for models that wrap JSON in
/// prose. `None` when no such span exists.
pub fn json_object_slice(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_matching_language_block() {
        let resp = "```bash\npip install x\n```\n\n```python\nprint(1)\n```";
        assert_eq!(extract_code(resp, "python"), "print(1)");
    }

    #[test]
    fn alias_tag_matches() {
        let resp = "```py\nx = 1\n```";
        assert_eq!(extract_code(resp, "python"), "x = 1");
        let resp = "```golang\npackage main\n```";
        assert_eq!(extract_code(resp, "go"), "package main");
    }

    #[test]
    fn falls_back_to_any_block() {
        let resp = "Sure:\n```\nconsole.log(1)\n```";
        assert_eq!(extract_code(resp, "python"), "console.log(1)");
    }

    #[test]
    fn heuristic_skips_prose() {
        let resp = "Here is the code you asked for.\nimport os\n\ndef f():\n    return 1\n";
        let code = extract_code(resp, "python");
        assert!(code.starts_with("import os"));
        assert!(code.contains("return 1"));
        assert!(!code.contains("Here is"));
    }

    #[test]
    fn raw_response_when_nothing_matches() {
        assert_eq!(extract_code("  just words  ", "python"), "just words");
    }

    #[test]
    fn empty_fence_is_skipped() {
        let resp = "```python\n\n```\n```\nreal()\n```";
        assert_eq!(extract_code(resp, "python"), "real()");
    }

    #[test]
    fn json_slice() {
        assert_eq!(
            json_object_slice("Analysis: {\"a\": {\"b\": 1}} done"),
            Some("{\"a\": {\"b\": 1}}")
        );
        assert_eq!(json_object_slice("no json"), None);
        assert_eq!(json_object_slice("} backwards {"), None);
    }
}
