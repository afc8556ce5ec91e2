// Delegation block grammar
// A block begins at `<<<agent.<id>` on its own line and ends at `>>>`.

use once_cell::sync::Lazy;
use regex::Regex;

static DELEGATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<<<agent\.([a-z0-9_-]+)[\t ]*\r?\n([\s\S]*?)>>>").expect("delegation regex")
});

static JSON_FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```json[\t ]*\r?\n(.*?)```").expect("json fence regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationDirective {
    pub agent_id: String,
    pub prompt: String,
    /// The full matched block text, used for in-place replacement.
    pub block: String,
}

/// Scan supervisor output for delegation blocks, in order of appearance.
pub fn parse_delegations(text: &str) -> Vec<DelegationDirective> {
    DELEGATION_RE
        .captures_iter(text)
        .map(|caps| DelegationDirective {
            agent_id: caps[1].to_ascii_lowercase(),
            prompt: caps[2].trim().to_string(),
            block: caps[0].to_string(),
        })
        .collect()
}

/// Locate a JSON object payload inside free-form agent output: the first
/// ```json fence wins, otherwise the first balanced `{...}` span.
pub fn extract_json_payload(text: &str) -> Option<String> {
    if let Some(caps) = JSON_FENCE_RE.captures(text) {
        let fenced = caps[1].trim();
        if !fenced.is_empty() {
            return Some(fenced.to_string());
        }
    }
    first_balanced_object(text).or_else(|| first_balanced_array(text))
}

fn first_balanced_object(text: &str) -> Option<String> {
    first_balanced(text, '{', '}')
}

fn first_balanced_array(text: &str) -> Option<String> {
    first_balanced(text, '[', ']')
}

fn first_balanced(text: &str, open: char, close: char) -> Option<String> {
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_block() {
        let text = "ok\n<<<agent.claude\nWrite a haiku\n>>>\n";
        let directives = parse_delegations(text);
        assert_eq!(directives.len(), 1);
        assert_eq!(directives[0].agent_id, "claude");
        assert_eq!(directives[0].prompt, "Write a haiku");
    }

    #[test]
    fn parses_multiple_blocks_in_order() {
        let text = "<<<agent.codex\nfirst\n>>>\nmiddle\n<<<agent.gemini\nsecond\n>>>";
        let directives = parse_delegations(text);
        assert_eq!(directives.len(), 2);
        assert_eq!(directives[0].agent_id, "codex");
        assert_eq!(directives[1].agent_id, "gemini");
    }

    #[test]
    fn id_charset_is_restricted() {
        let text = "<<<agent.Not Valid!\nx\n>>>";
        assert!(parse_delegations(text).is_empty());
    }

    #[test]
    fn fence_preferred_over_bare_object() {
        let text = "{\"decoy\": 1}\n```json\n{\"real\": true}\n```";
        assert_eq!(extract_json_payload(text).unwrap(), "{\"real\": true}");
    }

    #[test]
    fn balanced_object_fallback_skips_strings() {
        let text = "prefix {\"a\": \"}\", \"b\": {\"c\": 2}} suffix";
        assert_eq!(
            extract_json_payload(text).unwrap(),
            "{\"a\": \"}\", \"b\": {\"c\": 2}}"
        );
    }

    #[test]
    fn no_payload_yields_none() {
        assert!(extract_json_payload("nothing to see").is_none());
    }
}
