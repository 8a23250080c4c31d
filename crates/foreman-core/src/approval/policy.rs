//! Deterministic risk rule table.

use serde::{Deserialize, Serialize};

use super::risk::RiskLevel;
use crate::error::{ForemanError, ForemanResult};

/// What a [`RiskRule`] looks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RiskMatcher {
    /// The action descriptor contains one of these words (case-insensitive,
    /// whole-word).
    Verb { verbs: Vec<String> },
    /// A touched resource starts with this namespace prefix.
    Namespace { prefix: String },
    /// Substring match against the action descriptor or any resource.
    Label { pattern: String },
}

/// One row of the rule table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskRule {
    #[serde(flatten)]
    pub matcher: RiskMatcher,
    pub risk_level: RiskLevel,
    /// Approval timeout for actions classified by this rule. Outranks every
    /// other timeout; `None` leaves the choice to the gate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

enum Subject<'a> {
    Action(&'a str),
    Resource(&'a str),
}

impl RiskRule {
    pub fn verbs<I, S>(verbs: I, risk_level: RiskLevel) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            matcher: RiskMatcher::Verb {
                verbs: verbs.into_iter().map(Into::into).collect(),
            },
            risk_level,
            timeout_secs: None,
        }
    }

    pub fn namespace(prefix: impl Into<String>, risk_level: RiskLevel) -> Self {
        Self {
            matcher: RiskMatcher::Namespace {
                prefix: prefix.into(),
            },
            risk_level,
            timeout_secs: None,
        }
    }

    pub fn label(pattern: impl Into<String>, risk_level: RiskLevel) -> Self {
        Self {
            matcher: RiskMatcher::Label {
                pattern: pattern.into(),
            },
            risk_level,
            timeout_secs: None,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    fn matches(&self, subject: &Subject<'_>) -> bool {
        match (&self.matcher, subject) {
            (RiskMatcher::Verb { verbs }, Subject::Action(action)) => words(action)
                .any(|word| verbs.iter().any(|v| v.eq_ignore_ascii_case(word))),
            (RiskMatcher::Namespace { prefix }, Subject::Resource(resource)) => {
                resource.starts_with(prefix.as_str())
            }
            (RiskMatcher::Label { pattern }, Subject::Action(s) | Subject::Resource(s)) => {
                s.contains(pattern.as_str())
            }
            _ => false,
        }
    }
}

fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_'))
        .filter(|w| !w.is_empty())
}

/// Result of classifying an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    /// Approval timeout of the rule that set `level`, if it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Human-readable description of each rule that fired.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matched: Vec<String>,
}

/// Ordered rule table.
///
/// The action descriptor and each resource are classified independently,
/// first matching rule wins per subject; the action's level is the highest
/// across subjects. Nothing matching means `LOW`.
///
/// `default_timeout_secs` is the last fallback for approval waits: a rule's
/// own timeout and the gate's configured timeout both come first.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RiskPolicy {
    #[serde(default)]
    pub rules: Vec<RiskRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_secs: Option<u64>,
}

impl RiskPolicy {
    /// An empty policy: everything is `LOW`.
    pub fn permissive() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// [`ForemanError::InvalidConfig`] if any timeout is zero, since a zero
    /// wait rejects every gated action before an approver can answer.
    pub fn validate(&self) -> ForemanResult<()> {
        if self.default_timeout_secs == Some(0) {
            return Err(ForemanError::InvalidConfig(
                "risk policy default_timeout_secs must be greater than zero".into(),
            ));
        }
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.timeout_secs == Some(0) {
                return Err(ForemanError::InvalidConfig(format!(
                    "risk rule {index} ({}) has timeout_secs = 0",
                    rule.risk_level
                )));
            }
        }
        Ok(())
    }

    pub fn with_rule(mut self, rule: RiskRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Standard rule table.
    ///
    /// | Matcher                                         | Level    |
    /// |-------------------------------------------------|----------|
    /// | namespace `prod/`                               | CRITICAL |
    /// | namespace `secrets/`                            | CRITICAL |
    /// | verb delete, drop, destroy, purge, force-push   | HIGH     |
    /// | verb deploy                                     | HIGH     |
    /// | verb write, update                              | MEDIUM   |
    pub fn standard() -> Self {
        Self {
            rules: vec![
                RiskRule::namespace("prod/", RiskLevel::Critical).with_timeout_secs(600),
                RiskRule::namespace("secrets/", RiskLevel::Critical).with_timeout_secs(600),
                RiskRule::verbs(
                    ["delete", "drop", "destroy", "purge", "force-push"],
                    RiskLevel::High,
                ),
                RiskRule::verbs(["deploy"], RiskLevel::High),
                RiskRule::verbs(["write", "update"], RiskLevel::Medium),
            ],
            default_timeout_secs: None,
        }
    }

    /// Classify an action and the resources it touches.
    pub fn classify<S: AsRef<str>>(&self, action: &str, resources: &[S]) -> RiskAssessment {
        let subjects = std::iter::once(Subject::Action(action))
            .chain(resources.iter().map(|r| Subject::Resource(r.as_ref())));

        let mut assessment = RiskAssessment {
            level: RiskLevel::Low,
            timeout_secs: None,
            matched: Vec::new(),
        };
        let mut top: Option<RiskLevel> = None;

        for subject in subjects {
            let Some(rule) = self.rules.iter().find(|r| r.matches(&subject)) else {
                continue;
            };
            let name = match subject {
                Subject::Action(a) => format!("action {a:?}"),
                Subject::Resource(r) => format!("resource {r:?}"),
            };
            assessment
                .matched
                .push(format!("{name} -> {}", rule.risk_level));
            if top.map_or(true, |level| rule.risk_level > level) {
                top = Some(rule.risk_level);
                assessment.level = rule.risk_level;
                assessment.timeout_secs = rule.timeout_secs;
            }
        }
        assessment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONE: [&str; 0] = [];

    #[test]
    fn test_destructive_verb_is_high() {
        let a = RiskPolicy::standard().classify("DROP table users", &["db/users"]);
        assert_eq!(a.level, RiskLevel::High);
        assert_eq!(a.timeout_secs, None);
    }

    #[test]
    fn test_policy_default_is_not_a_rule_timeout() {
        let policy = RiskPolicy {
            rules: vec![RiskRule::verbs(["drop"], RiskLevel::High)],
            default_timeout_secs: Some(45),
        };
        assert_eq!(policy.classify("drop table", &NONE).timeout_secs, None);
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        assert!(RiskPolicy::standard().validate().is_ok());

        let zero_rule = RiskPolicy::permissive()
            .with_rule(RiskRule::namespace("prod/", RiskLevel::Critical).with_timeout_secs(0));
        let err = zero_rule.validate().unwrap_err();
        assert!(matches!(err, ForemanError::InvalidConfig(ref m) if m.contains("rule 0")), "{err}");

        let zero_default = RiskPolicy {
            rules: Vec::new(),
            default_timeout_secs: Some(0),
        };
        assert!(matches!(zero_default.validate(), Err(ForemanError::InvalidConfig(_))));
    }

    #[test]
    fn test_verbs_match_whole_words_only() {
        let a = RiskPolicy::standard().classify("rewrite the summary", &NONE);
        assert_eq!(a.level, RiskLevel::Low);
        let a = RiskPolicy::standard().classify("force-push main", &NONE);
        assert_eq!(a.level, RiskLevel::High);
    }

    #[test]
    fn test_restricted_namespace_escalates_to_critical() {
        let a = RiskPolicy::standard().classify("update config", &["staging/app", "prod/app"]);
        assert_eq!(a.level, RiskLevel::Critical);
        assert_eq!(a.timeout_secs, Some(600));
        assert_eq!(a.matched.len(), 2);
    }

    #[test]
    fn test_unmatched_action_is_low() {
        let a = RiskPolicy::standard().classify("summarize notes", &["docs/notes.md"]);
        assert_eq!(a.level, RiskLevel::Low);
        assert!(a.matched.is_empty());
    }

    #[test]
    fn test_first_match_wins_per_subject() {
        let policy = RiskPolicy::permissive()
            .with_rule(RiskRule::label("report", RiskLevel::Medium))
            .with_rule(RiskRule::verbs(["delete"], RiskLevel::Critical));
        let a = policy.classify("delete report", &NONE);
        assert_eq!(a.level, RiskLevel::Medium);
    }

    #[test]
    fn test_rules_parse_from_plan_json() {
        let rules: Vec<RiskRule> = serde_json::from_value(serde_json::json!([
            {"kind": "verb", "verbs": ["rotate"], "risk_level": "HIGH"},
            {"kind": "namespace", "prefix": "billing/", "risk_level": "CRITICAL", "timeout_secs": 30}
        ]))
        .unwrap();
        let policy = RiskPolicy {
            rules,
            default_timeout_secs: None,
        };
        let a = policy.classify("rotate keys", &["billing/keys"]);
        assert_eq!(a.level, RiskLevel::Critical);
        assert_eq!(a.timeout_secs, Some(30));
    }
}
