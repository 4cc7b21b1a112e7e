//! Text filter engine deciding which messages a rule forwards.
//!
//! Filters come in two layers: per-rule filters stored on the rule row, and
//! global filters stored in settings. Include rules override excludes.

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    Exclude,
    Include,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    Contains,
    Regex,
    Starts,
    Ends,
    Keyword,
}

fn default_true() -> bool {
    true
}

/// One pattern with its matching semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    pub pattern: String,
    #[serde(default = "FilterRule::default_action")]
    pub action: FilterAction,
    #[serde(default = "FilterRule::default_kind")]
    pub kind: FilterKind,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub name: Option<String>,
}

impl FilterRule {
    fn default_action() -> FilterAction {
        FilterAction::Exclude
    }

    fn default_kind() -> FilterKind {
        FilterKind::Contains
    }

    pub fn new(pattern: impl Into<String>, action: FilterAction, kind: FilterKind) -> Self {
        Self {
            pattern: pattern.into(),
            action,
            kind,
            case_sensitive: false,
            enabled: true,
            name: None,
        }
    }

    /// Human-readable label for skip reasons.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.pattern)
    }

    /// Whether this rule matches `text`. An invalid regex never matches.
    pub fn matches(&self, text: &str) -> bool {
        if !self.enabled {
            return false;
        }
        match self.kind {
            FilterKind::Contains => {
                if self.case_sensitive {
                    text.contains(&self.pattern)
                } else {
                    text.to_lowercase().contains(&self.pattern.to_lowercase())
                }
            }
            FilterKind::Starts => {
                if self.case_sensitive {
                    text.starts_with(&self.pattern)
                } else {
                    text.to_lowercase().starts_with(&self.pattern.to_lowercase())
                }
            }
            FilterKind::Ends => {
                if self.case_sensitive {
                    text.ends_with(&self.pattern)
                } else {
                    text.to_lowercase().ends_with(&self.pattern.to_lowercase())
                }
            }
            FilterKind::Regex => self.regex_matches(&self.pattern, text),
            FilterKind::Keyword => {
                let escaped = format!(r"\b{}\b", regex::escape(&self.pattern));
                self.regex_matches(&escaped, text)
            }
        }
    }

    fn regex_matches(&self, pattern: &str, text: &str) -> bool {
        let pattern = if self.case_sensitive {
            pattern.to_string()
        } else {
            format!("(?i){pattern}")
        };
        match Regex::new(&pattern) {
            Ok(re) => re.is_match(text),
            Err(err) => {
                tracing::debug!(pattern, error = %err, "invalid filter regex never matches");
                false
            }
        }
    }
}

/// A serializable bundle of filter rules, stored as JSON in `filter_spec`
/// or the `global_filters` setting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub rules: Vec<FilterRule>,
}

impl FilterConfig {
    pub fn add_exclude(&mut self, pattern: impl Into<String>, kind: FilterKind) {
        self.rules
            .push(FilterRule::new(pattern, FilterAction::Exclude, kind));
    }

    pub fn add_include(&mut self, pattern: impl Into<String>, kind: FilterKind) {
        self.rules
            .push(FilterRule::new(pattern, FilterAction::Include, kind));
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"rules\":[]}".to_string())
    }

    /// Parse stored JSON. Malformed input yields an empty config so a bad
    /// stored spec degrades to "forward everything" instead of wedging sync.
    pub fn from_json(json: &str) -> Self {
        serde_json::from_str(json).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Parse the compact CLI filter syntax: `;`-separated patterns, `!` prefix
/// marks an include (whitelist) entry. `"ad;spam;!important"` excludes "ad"
/// and "spam" but lets anything mentioning "important" through.
pub fn parse_filter_string(spec: &str) -> FilterConfig {
    let mut config = FilterConfig::default();
    for part in spec.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some(pattern) = part.strip_prefix('!') {
            if !pattern.is_empty() {
                config.add_include(pattern, FilterKind::Contains);
            }
        } else {
            config.add_exclude(part, FilterKind::Contains);
        }
    }
    config
}

/// Combines a rule's own filters with the global ones and renders a verdict.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub rule_filters: FilterConfig,
    pub global_filters: FilterConfig,
}

impl MessageFilter {
    pub fn new(rule_filters: FilterConfig, global_filters: FilterConfig) -> Self {
        Self {
            rule_filters,
            global_filters,
        }
    }

    fn all_rules(&self) -> impl Iterator<Item = &FilterRule> {
        self.rule_filters
            .rules
            .iter()
            .chain(self.global_filters.rules.iter())
    }

    /// Decide whether `text` should be forwarded; the second element is the
    /// skip reason when blocked.
    ///
    /// Media-only messages have empty text and always pass. A matching
    /// include rule overrides every exclude, rule-level or global.
    pub fn should_forward(&self, text: &str) -> (bool, Option<String>) {
        if text.is_empty() {
            return (true, None);
        }
        for rule in self.all_rules() {
            if rule.action == FilterAction::Include && rule.matches(text) {
                return (true, None);
            }
        }
        for rule in self.all_rules() {
            if rule.action == FilterAction::Exclude && rule.matches(text) {
                return (false, Some(format!("Blocked by filter: {}", rule.label())));
            }
        }
        (true, None)
    }
}
