//! Deterministic CSS selector derivation from observed element properties.
//!
//! [`SelectorEngine::derive`] applies a strict-priority cascade and returns the
//! first rule that matches:
//!
//! 1. `id`                                  → `#id`                      (High)
//! 2. test attribute (`data-testid`, …)      → `[data-testid='v']`        (High)
//! 3. `name` on a form control              → `input[name='v']`          (Medium-High)
//! 4. up to three non-generic classes       → `button.btn.btn-primary`   (Medium)
//! 5. other attribute, in priority order    → `a[role='tab']`            (Medium-Low)
//! 6. tag only                              → `div`                      (Low)
//!
//! The function is total and depends on nothing but its input and the rule
//! tables in [`SelectorRules`].

use std::collections::HashSet;
use std::sync::OnceLock;

use autoscribe_types::{
    AutoscribeError, Confidence, ElementPropertyRecord, Result, SelectorPayload, SelectorResult,
    SelectorStrategy,
};
use regex::Regex;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// SelectorRules — configurable rule tables
// ---------------------------------------------------------------------------

/// Rule tables driving the cascade. Every list is consulted in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorRules {
    pub test_attributes: Vec<String>,
    /// Tags whose test-attribute selector is prefixed with the tag name.
    pub generic_containers: Vec<String>,
    pub form_controls: Vec<String>,
    /// Class tokens never used in a class combination (compared lower-cased).
    pub class_denylist: Vec<String>,
    /// Regular expressions matching layout-utility class tokens.
    pub class_deny_patterns: Vec<String>,
    pub other_attributes: Vec<String>,
    pub max_classes: usize,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for SelectorRules {
    fn default() -> Self {
        Self {
            test_attributes: strings(&["data-testid", "data-test-id"]),
            generic_containers: strings(&["div", "span"]),
            form_controls: strings(&["input", "select", "textarea", "button"]),
            class_denylist: strings(&[
                "active", "hidden", "disabled", "selected", "focus", "focused", "hover", "open",
                "opened", "closed", "show", "shown", "visible", "invisible", "collapse",
                "collapsed", "expanded", "checked", "loading", "loaded", "fade", "in",
                "is-active", "is-hidden", "is-disabled", "is-open", "is-selected", "is-focused",
                "ng-valid", "ng-invalid", "ng-touched", "ng-untouched", "ng-pristine", "ng-dirty",
            ]),
            class_deny_patterns: strings(&[
                r"^col(-(xs|sm|md|lg|xl|xxl))?(-(\d+|auto))?$",
                r"^(row|container|container-fluid|clearfix|pull-left|pull-right)$",
                r"^(offset|order)(-(xs|sm|md|lg|xl|xxl))?-\d+$",
                r"^[mp][trblxyse]?(-(xs|sm|md|lg|xl|xxl))?-(n?\d+|auto)$",
                r"^d(-(xs|sm|md|lg|xl|xxl))?-(none|inline|inline-block|block|flex|inline-flex|grid|table)$",
                r"^(flex|justify-content|align-items|align-content|align-self|float|gap|g[xy]?)-[a-z0-9-]+$",
                r"^[wh]-(\d+|auto|full|screen)$",
                r"^text-(left|right|center|start|end|justify)$",
                r"^[a-z0-9]+:",
            ]),
            other_attributes: strings(&[
                "role",
                "type",
                "aria-label",
                "placeholder",
                "title",
                "alt",
                "href",
                "for",
            ]),
            max_classes: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// SelectorEngine
// ---------------------------------------------------------------------------

/// Compiled form of [`SelectorRules`].
#[derive(Debug, Clone)]
pub struct SelectorEngine {
    rules: SelectorRules,
    deny_patterns: Vec<Regex>,
}

impl SelectorEngine {
    /// Compile `rules`, rejecting invalid deny patterns.
    pub fn with_rules(rules: SelectorRules) -> Result<Self> {
        let deny_patterns = rules
            .class_deny_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    AutoscribeError::Config(format!("invalid class deny pattern '{p}': {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rules: normalize_rules(rules),
            deny_patterns,
        })
    }

    pub fn rules(&self) -> &SelectorRules {
        &self.rules
    }

    /// Derive the selector for a single element.
    pub fn derive(&self, properties: &ElementPropertyRecord) -> SelectorResult {
        let tag = normalize_tag(&properties.tag_name);
        let (selector, strategy_used, confidence) = self.cascade(properties, &tag);
        SelectorResult {
            key_name: properties.key_name.clone(),
            selector,
            strategy_used,
            confidence,
        }
    }

    /// Derive one selector per distinct key. The first record for a key wins.
    pub fn derive_all(&self, records: &[ElementPropertyRecord]) -> SelectorPayload {
        let mut seen = HashSet::new();
        let mut selectors = Vec::with_capacity(records.len());
        let mut ambiguous = Vec::new();

        for record in records {
            if !seen.insert(record.key_name.as_str()) {
                tracing::warn!(
                    key = %record.key_name,
                    "Duplicate element key, keeping first record"
                );
                continue;
            }
            let result = self.derive(record);
            if result.confidence == Confidence::Low {
                tracing::warn!(
                    key = %result.key_name,
                    selector = %result.selector,
                    "Only a tag selector could be derived"
                );
                ambiguous.push(result.key_name.clone());
            }
            selectors.push(result);
        }

        SelectorPayload {
            selectors,
            ambiguous,
        }
    }

    fn cascade(
        &self,
        props: &ElementPropertyRecord,
        tag: &str,
    ) -> (String, SelectorStrategy, Confidence) {
        if let Some(id) = non_empty(props.id.as_deref()) {
            return (
                format!("#{}", css_ident(id)),
                SelectorStrategy::Id,
                Confidence::High,
            );
        }

        for key in &self.rules.test_attributes {
            if let Some(value) = attribute(props, key) {
                let bare = attribute_selector(key, value);
                let selector = if self.rules.generic_containers.iter().any(|t| t == tag) {
                    format!("{tag}{bare}")
                } else {
                    bare
                };
                return (selector, SelectorStrategy::TestAttribute, Confidence::High);
            }
        }

        if self.rules.form_controls.iter().any(|t| t == tag) {
            if let Some(value) = attribute(props, "name") {
                return (
                    format!("{tag}{}", attribute_selector("name", value)),
                    SelectorStrategy::NameAttribute,
                    Confidence::MediumHigh,
                );
            }
        }

        let classes = self.qualifying_classes(&props.class_list);
        if !classes.is_empty() {
            let chain: String = classes.iter().map(|c| format!(".{}", css_ident(c))).collect();
            return (
                format!("{tag}{chain}"),
                SelectorStrategy::ClassCombination,
                Confidence::Medium,
            );
        }

        for key in &self.rules.other_attributes {
            if let Some(value) = attribute(props, key) {
                return (
                    format!("{tag}{}", attribute_selector(key, value)),
                    SelectorStrategy::OtherAttribute,
                    Confidence::MediumLow,
                );
            }
        }

        (tag.to_string(), SelectorStrategy::TagOnly, Confidence::Low)
    }

    fn qualifying_classes<'a>(&self, class_list: &'a [String]) -> Vec<&'a str> {
        let mut picked: Vec<&str> = Vec::new();
        for token in class_list.iter().flat_map(|c| c.split_whitespace()) {
            if picked.len() == self.rules.max_classes {
                break;
            }
            if picked.contains(&token) || self.is_generic_class(token) {
                continue;
            }
            picked.push(token);
        }
        picked
    }

    fn is_generic_class(&self, token: &str) -> bool {
        let lower = token.to_ascii_lowercase();
        self.rules.class_denylist.iter().any(|d| *d == lower)
            || self.deny_patterns.iter().any(|re| re.is_match(&lower))
    }
}

impl Default for SelectorEngine {
    fn default() -> Self {
        let rules = SelectorRules::default();
        let deny_patterns = rules
            .class_deny_patterns
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        Self {
            rules,
            deny_patterns,
        }
    }
}

/// Derive a selector with the default rule tables.
pub fn derive(properties: &ElementPropertyRecord) -> SelectorResult {
    static DEFAULT: OnceLock<SelectorEngine> = OnceLock::new();
    DEFAULT.get_or_init(SelectorEngine::default).derive(properties)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn normalize_rules(mut rules: SelectorRules) -> SelectorRules {
    for list in [
        &mut rules.generic_containers,
        &mut rules.form_controls,
        &mut rules.class_denylist,
    ] {
        for item in list.iter_mut() {
            *item = item.trim().to_ascii_lowercase();
        }
    }
    rules
}

fn normalize_tag(tag: &str) -> String {
    let tag = tag.trim();
    if tag.is_empty() {
        "*".to_string()
    } else {
        tag.to_ascii_lowercase()
    }
}

/// The observed value, unless it is blank. Selectors match exactly, so the
/// value itself is never trimmed.
fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn attribute<'a>(props: &'a ElementPropertyRecord, key: &str) -> Option<&'a str> {
    non_empty(props.attributes.get(key).map(String::as_str))
}

fn attribute_selector(key: &str, value: &str) -> String {
    format!("[{}={}]", css_ident(key), quote_value(value))
}

/// Single-quoted CSS string with `\` and `'` escaped.
fn quote_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' | '\'' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\a "),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Serialize `ident` as a CSS identifier (CSSOM `CSS.escape` rules).
fn css_ident(ident: &str) -> String {
    let chars: Vec<char> = ident.chars().collect();
    let mut out = String::with_capacity(ident.len());
    for (i, &c) in chars.iter().enumerate() {
        let leading_digit = c.is_ascii_digit() && (i == 0 || (i == 1 && chars[0] == '-'));
        match c {
            '\0' => out.push('\u{FFFD}'),
            '\u{1}'..='\u{1f}' | '\u{7f}' => out.push_str(&format!("\\{:x} ", c as u32)),
            _ if leading_digit => out.push_str(&format!("\\{:x} ", c as u32)),
            '-' if i == 0 && chars.len() == 1 => out.push_str("\\-"),
            _ if c as u32 >= 0x80 || c == '-' || c == '_' || c.is_ascii_alphanumeric() => {
                out.push(c)
            }
            _ => {
                out.push('\\');
                out.push(c);
            }
        }
    }
    out
}
