//! Run-scoped shared state.
//!
//! A write-once map from output key to JSON value. Steps never address each
//! other directly; a step's input template names the keys it reads with
//! `{key}` or `{key.path.0.field}` placeholders.
//!
//! A string that is exactly one placeholder is replaced by the stored value
//! itself, so structured results flow through unchanged. Placeholders inside
//! longer text are rendered as text. `{{` and `}}` produce literal braces.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Map, Value};

use crate::error::{ForemanError, ForemanResult};

/// Reserved key under which the task input is seeded at run start.
pub const INPUT_KEY: &str = "input";

/// Field name of the marker substituted for a failed producer's key.
pub const MISSING_MARKER: &str = "$missing";

#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Value(Value),
    Missing { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MissingPolicy {
    Fail,
    Mark,
}

/// Write-once key/value store for one orchestration run.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    slots: BTreeMap<String, Slot>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with the task input under [`INPUT_KEY`].
    pub fn with_input(input: Value) -> Self {
        let mut slots = BTreeMap::new();
        slots.insert(INPUT_KEY.to_string(), Slot::Value(input));
        Self { slots }
    }

    /// Write `value` under `key`.
    ///
    /// # Errors
    ///
    /// [`ForemanError::DuplicateKey`] if the key was already written (or
    /// marked missing) in this run; [`ForemanError::InvalidKey`] for a key
    /// outside `[A-Za-z0-9_-]`.
    pub fn put(&mut self, key: impl Into<String>, value: Value) -> ForemanResult<()> {
        self.insert(key.into(), Slot::Value(value))
    }

    /// Record that the producer of `key` failed. Reads through
    /// [`resolve_template_with_markers`](Self::resolve_template_with_markers)
    /// see an explicit marker instead of failing.
    pub fn mark_missing(&mut self, key: impl Into<String>, reason: impl Into<String>) -> ForemanResult<()> {
        self.insert(
            key.into(),
            Slot::Missing {
                reason: reason.into(),
            },
        )
    }

    fn insert(&mut self, key: String, slot: Slot) -> ForemanResult<()> {
        validate_key(&key)?;
        if self.slots.contains_key(&key) {
            return Err(ForemanError::DuplicateKey { key });
        }
        self.slots.insert(key, slot);
        Ok(())
    }

    /// # Errors
    ///
    /// [`ForemanError::MissingKey`] if `key` has no value.
    pub fn get(&self, key: &str) -> ForemanResult<&Value> {
        match self.slots.get(key) {
            Some(Slot::Value(v)) => Ok(v),
            _ => Err(ForemanError::MissingKey {
                key: key.to_string(),
            }),
        }
    }

    /// Whether `key` holds a value (not absent, not marked missing).
    pub fn contains(&self, key: &str) -> bool {
        matches!(self.slots.get(key), Some(Slot::Value(_)))
    }

    pub fn is_marked_missing(&self, key: &str) -> bool {
        matches!(self.slots.get(key), Some(Slot::Missing { .. }))
    }

    /// Resolve a dotted path such as `draft.sections.0.title`.
    pub fn lookup(&self, path: &str) -> ForemanResult<Value> {
        let (root, rest) = split_path(path);
        let mut current = self.get(root)?;
        if let Some(rest) = rest {
            for segment in rest.split('.') {
                let next = match current {
                    Value::Object(map) => map.get(segment),
                    Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                    _ => None,
                };
                current = next.ok_or_else(|| ForemanError::MissingKey {
                    key: path.to_string(),
                })?;
            }
        }
        Ok(current.clone())
    }

    /// Substitute placeholders in a JSON template.
    ///
    /// # Errors
    ///
    /// [`ForemanError::MissingKey`] if any referenced key is absent or was
    /// marked missing.
    pub fn resolve_template(&self, template: &Value) -> ForemanResult<Value> {
        self.resolve_value(template, MissingPolicy::Fail)
    }

    /// Like [`resolve_template`](Self::resolve_template), but keys whose
    /// producer failed resolve to `{"$missing": key, "reason": ...}` (or
    /// `<missing:key>` inside text). Keys that were never written still fail.
    pub fn resolve_template_with_markers(&self, template: &Value) -> ForemanResult<Value> {
        self.resolve_value(template, MissingPolicy::Mark)
    }

    /// Substitute placeholders in plain text.
    pub fn resolve_text(&self, text: &str) -> ForemanResult<String> {
        match self.resolve_string(text, MissingPolicy::Fail)? {
            Value::String(s) => Ok(s),
            other => Ok(render(&other)),
        }
    }

    /// An independent copy; writes to the fork never reach this store.
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// All keys holding values.
    pub fn keys(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Value(_)))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// A JSON object of every stored value, for reporting.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.slots
            .iter()
            .filter_map(|(k, slot)| match slot {
                Slot::Value(v) => Some((k.clone(), v.clone())),
                Slot::Missing { .. } => None,
            })
            .collect()
    }

    fn resolve_value(&self, template: &Value, policy: MissingPolicy) -> ForemanResult<Value> {
        match template {
            Value::String(s) => self.resolve_string(s, policy),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve_value(item, policy))
                .collect::<ForemanResult<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve_value(v, policy)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn resolve_string(&self, text: &str, policy: MissingPolicy) -> ForemanResult<Value> {
        let tokens = tokenize(text);
        if let [Token::Placeholder(path)] = tokens.as_slice() {
            return self.resolve_placeholder(path, policy, false);
        }
        let mut out = String::with_capacity(text.len());
        for token in tokens {
            match token {
                Token::Text(t) => out.push_str(&t),
                Token::Placeholder(path) => {
                    let value = self.resolve_placeholder(path, policy, true)?;
                    out.push_str(&render(&value));
                }
            }
        }
        Ok(Value::String(out))
    }

    fn resolve_placeholder(&self, path: &str, policy: MissingPolicy, inline: bool) -> ForemanResult<Value> {
        let (root, _) = split_path(path);
        if policy == MissingPolicy::Mark {
            if let Some(Slot::Missing { reason }) = self.slots.get(root) {
                return Ok(if inline {
                    Value::String(format!("<missing:{root}>"))
                } else {
                    json!({ MISSING_MARKER: root, "reason": reason })
                });
            }
        }
        self.lookup(path)
    }
}

/// Root keys a template reads, for build-time wiring checks.
pub fn referenced_keys(template: &Value) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    collect_keys(template, &mut keys);
    keys
}

fn collect_keys(template: &Value, keys: &mut BTreeSet<String>) {
    match template {
        Value::String(s) => {
            for token in tokenize(s) {
                if let Token::Placeholder(path) = token {
                    keys.insert(split_path(path).0.to_string());
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|i| collect_keys(i, keys)),
        Value::Object(map) => map.values().for_each(|v| collect_keys(v, keys)),
        _ => {}
    }
}

/// Check that `key` is usable as an output key.
pub fn validate_key(key: &str) -> ForemanResult<()> {
    if key.is_empty() {
        return Err(ForemanError::InvalidKey {
            key: key.to_string(),
            reason: "key must not be empty".into(),
        });
    }
    if let Some(c) = key.chars().find(|c| !is_key_char(*c)) {
        return Err(ForemanError::InvalidKey {
            key: key.to_string(),
            reason: format!("character {c:?} is not allowed"),
        });
    }
    Ok(())
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn split_path(path: &str) -> (&str, Option<&str>) {
    match path.split_once('.') {
        Some((root, rest)) => (root, Some(rest)),
        None => (path, None),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, PartialEq)]
enum Token<'a> {
    Text(String),
    Placeholder(&'a str),
}

fn tokenize(text: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut rest = text;

    while let Some(pos) = rest.find(['{', '}']) {
        literal.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("{{") {
            literal.push('{');
            rest = &tail[2..];
        } else if tail.starts_with("}}") {
            literal.push('}');
            rest = &tail[2..];
        } else if tail.starts_with('{') {
            match tail[1..].find('}') {
                Some(end) if is_placeholder_path(&tail[1..1 + end]) => {
                    if !literal.is_empty() {
                        tokens.push(Token::Text(std::mem::take(&mut literal)));
                    }
                    tokens.push(Token::Placeholder(&tail[1..1 + end]));
                    rest = &tail[end + 2..];
                }
                _ => {
                    literal.push('{');
                    rest = &tail[1..];
                }
            }
        } else {
            literal.push('}');
            rest = &tail[1..];
        }
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        tokens.push(Token::Text(literal));
    }
    tokens
}

fn is_placeholder_path(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('.')
        && !path.ends_with('.')
        && path.chars().all(|c| is_key_char(c) || c == '.')
}
