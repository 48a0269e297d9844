//! The access-control evaluator: compiled policy rules matching
//! `(principal labels, action, secret name)` triples.

use regex::{Regex, RegexSet};
use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

/// The closed action set. Unknown actions in a policy document fail to
/// compile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Get,
    Info,
    Put,
    CreateVersion,
    Activate,
    Delete,
}

impl Action {
    fn parse(s: &str) -> Option<Action> {
        match s {
            "get" => Some(Action::Get),
            "info" => Some(Action::Info),
            "put" => Some(Action::Put),
            "create-version" => Some(Action::CreateVersion),
            "activate" => Some(Action::Activate),
            "delete" => Some(Action::Delete),
            _ => None,
        }
    }
}

/// One rule as it appears in a policy document, before compilation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rule {
    pub principal: Vec<String>,
    pub action: Vec<String>,
    pub secret: Vec<String>,
}

/// A rule after its globs have been compiled to an anchored regex
/// alternation.
#[derive(Clone, Debug)]
struct CompiledRule {
    principals: Vec<String>,
    actions: Vec<Action>,
    secret_set: RegexSet,
}

/// A compiled, ready-to-evaluate policy: a sequence of rules. Allows a
/// request iff any rule matches; an empty policy allows nothing.
#[derive(Clone, Debug, Default)]
pub struct Policy {
    rules: Vec<CompiledRule>,
}

/// Turns a `*`-glob into an anchored regex: `*` becomes `.*`, every other
/// character is regex-quoted, and the whole pattern is anchored at both
/// ends.
fn glob_to_anchored_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 2);
    out.push('^');
    for ch in glob.chars() {
        if ch == '*' {
            out.push_str(".*");
        } else {
            out.push_str(&regex::escape(&ch.to_string()));
        }
    }
    out.push('$');
    out
}

impl Policy {
    /// Compiles a sequence of [`Rule`]s, validating every action against
    /// the closed action set. Collects and reports every invalid rule
    /// together rather than stopping at the first.
    pub fn compile(rules: Vec<Rule>) -> CResult<Policy> {
        let mut compiled = Vec::with_capacity(rules.len());
        let mut errors = Vec::new();

        for (idx, rule) in rules.into_iter().enumerate() {
            let mut actions = Vec::with_capacity(rule.action.len());
            for action in &rule.action {
                match Action::parse(action) {
                    Some(a) => actions.push(a),
                    None => errors.push(format!("rule {idx}: unknown action {action:?}")),
                }
            }

            let patterns: Vec<String> = rule.secret.iter().map(|g| glob_to_anchored_regex(g)).collect();
            let secret_set = match RegexSet::new(&patterns) {
                Ok(set) => set,
                Err(err) => {
                    errors.push(format!("rule {idx}: invalid secret pattern: {err}"));
                    continue;
                }
            };

            if errors.is_empty() {
                compiled.push(CompiledRule {
                    principals: rule.principal,
                    actions,
                    secret_set,
                });
            }
        }

        if !errors.is_empty() {
            return Err(Error::Internal(format!(
                "policy compile failed: {}",
                errors.join("; ")
            )));
        }

        Ok(Policy { rules: compiled })
    }

    /// Decides whether any rule grants `action` on `secret` to a caller
    /// carrying `labels`.
    pub fn allow(&self, labels: &[&str], secret: &str, action: Action) -> bool {
        self.rules.iter().any(|rule| {
            rule.actions.contains(&action)
                && rule.principals.iter().any(|p| labels.contains(&p.as_str()))
                && rule.secret_set.is_match(secret)
        })
    }
}

/// Parses a policy document in a permissive JSON variant: trailing commas
/// and `//`/`/* */` comments are allowed, the way hand-written config
/// files often are. Implemented here as a small preprocessing pass ahead
/// of `serde_json`, rather than pulling in a JSON5 parser for a single
/// call site.
pub fn parse_policy_document(text: &str) -> CResult<Vec<Rule>> {
    let stripped = strip_json_comments_and_trailing_commas(text);
    serde_json::from_str(&stripped)
        .map_err(|err| Error::Internal(format!("policy document: {err}")))
}

fn strip_json_comments_and_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;

    while let Some(ch) = chars.next() {
        if in_string {
            out.push(ch);
            if ch == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '/' if chars.peek() == Some(&'/') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            ',' => {
                // Look ahead past whitespace/comments already emitted; a
                // trailing comma is one directly followed (modulo
                // whitespace) by a closing bracket.
                let rest: String = chars.clone().collect();
                let trimmed = rest.trim_start();
                if trimmed.starts_with('}') || trimmed.starts_with(']') {
                    // drop the comma
                } else {
                    out.push(ch);
                }
            }
            _ => out.push(ch),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(principal: &[&str], action: &[&str], secret: &[&str]) -> Rule {
        Rule {
            principal: principal.iter().map(|s| s.to_string()).collect(),
            action: action.iter().map(|s| s.to_string()).collect(),
            secret: secret.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn glob_fidelity() {
        let policy = Policy::compile(vec![rule(&["tag:ok"], &["get"], &["a*c"])]).unwrap();
        assert!(policy.allow(&["tag:ok"], "abc", Action::Get));
        assert!(policy.allow(&["tag:ok"], "ac", Action::Get));
        assert!(policy.allow(&["tag:ok"], "aXYc", Action::Get));
        assert!(!policy.allow(&["tag:ok"], "abd", Action::Get));
    }

    #[test]
    fn non_glob_characters_stay_literal() {
        let policy = Policy::compile(vec![rule(&["tag:ok"], &["get"], &["a.b"])]).unwrap();
        assert!(policy.allow(&["tag:ok"], "a.b", Action::Get));
        assert!(!policy.allow(&["tag:ok"], "aXb", Action::Get));
    }

    #[test]
    fn rule_grants_only_its_declared_action_and_principal() {
        let policy = Policy::compile(vec![rule(&["tag:ok"], &["get"], &["p/*"])]).unwrap();
        assert!(policy.allow(&["tag:ok"], "p/x", Action::Get));
        assert!(!policy.allow(&["tag:ok"], "p/x", Action::Put));
        assert!(!policy.allow(&["tag:other"], "p/x", Action::Get));
        assert!(!policy.allow(&["tag:ok"], "q/x", Action::Get));
    }

    #[test]
    fn empty_policy_denies_everything() {
        let policy = Policy::compile(vec![]).unwrap();
        assert!(!policy.allow(&["tag:ok"], "anything", Action::Get));
    }

    #[test]
    fn unknown_action_fails_to_compile() {
        let err = Policy::compile(vec![rule(&["tag:ok"], &["frobnicate"], &["*"])]).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn multiple_rule_errors_reported_together() {
        let rules = vec![
            rule(&["a"], &["bogus1"], &["*"]),
            rule(&["b"], &["bogus2"], &["*"]),
        ];
        let err = Policy::compile(rules).unwrap_err().to_string();
        assert!(err.contains("bogus1"));
        assert!(err.contains("bogus2"));
    }

    #[test]
    fn parses_permissive_json_with_comments_and_trailing_commas() {
        let doc = r#"
        [
            // a comment
            {
                "principal": ["tag:ok"],
                "action": ["get", "info"],
                "secret": ["p/*"], /* trailing comma below */
            },
        ]
        "#;
        let rules = parse_policy_document(doc).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].action, vec!["get", "info"]);
    }
}
