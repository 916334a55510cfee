use crate::error::{ThrottlerError, ThrottlerResult};
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use validator::{Validate, ValidationError};

const DEFAULT_STATUS_CODE: u16 = 429;
const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";

/// Throttling policy attached to a rule. Immutable once the table is built.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_window"))]
    pub window: Duration,

    #[validate(range(min = 1))]
    pub max_requests: u64,

    #[serde(default = "default_status_code")]
    #[validate(range(min = 400, max = 599))]
    pub status_code: u16,

    #[serde(default = "default_message")]
    pub message: String,

    /// Do not count requests whose downstream response is below 400.
    #[serde(default)]
    pub skip_successful_requests: bool,

    /// Do not count requests whose downstream response is 400 or above.
    #[serde(default)]
    pub skip_failed_requests: bool,
}

fn default_status_code() -> u16 {
    DEFAULT_STATUS_CODE
}

fn default_message() -> String {
    DEFAULT_MESSAGE.to_string()
}

fn validate_window(window: &Duration) -> Result<(), ValidationError> {
    if window.as_millis() == 0 {
        return Err(ValidationError::new("window_too_short"));
    }
    Ok(())
}

impl Policy {
    pub fn new(window: Duration, max_requests: u64) -> Self {
        Self {
            window,
            max_requests,
            status_code: DEFAULT_STATUS_CODE,
            message: DEFAULT_MESSAGE.to_string(),
            skip_successful_requests: false,
            skip_failed_requests: false,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn skip_successful_requests(mut self, skip: bool) -> Self {
        self.skip_successful_requests = skip;
        self
    }

    pub fn skip_failed_requests(mut self, skip: bool) -> Self {
        self.skip_failed_requests = skip;
        self
    }

    /// Whether a downstream response with this status should be backed out
    /// of the counter.
    pub fn skips_status(&self, status: u16) -> bool {
        if status < 400 {
            self.skip_successful_requests
        } else {
            self.skip_failed_requests
        }
    }
}

/// Path matcher for a rule.
///
/// In rules files a pattern beginning with `^` is a regular expression;
/// anything else is a literal path prefix.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "String")]
pub enum PathPattern {
    Prefix(String),
    Regex(Regex),
}

impl PathPattern {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        PathPattern::Prefix(prefix.into())
    }

    pub fn regex(pattern: &str) -> ThrottlerResult<Self> {
        Ok(PathPattern::Regex(Regex::new(pattern)?))
    }

    pub fn is_match(&self, path: &str) -> bool {
        match self {
            PathPattern::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PathPattern::Regex(regex) => regex.is_match(path),
        }
    }
}

impl TryFrom<String> for PathPattern {
    type Error = regex::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.starts_with('^') {
            Ok(PathPattern::Regex(Regex::new(&value)?))
        } else {
            Ok(PathPattern::Prefix(value))
        }
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathPattern::Prefix(prefix) => f.write_str(prefix),
            PathPattern::Regex(regex) => f.write_str(regex.as_str()),
        }
    }
}

/// One entry of the rule table.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub pattern: PathPattern,

    #[validate(length(min = 1))]
    pub key_prefix: String,

    #[serde(flatten)]
    #[validate(nested)]
    pub policy: Policy,
}

impl Rule {
    pub fn new(pattern: PathPattern, key_prefix: impl Into<String>, policy: Policy) -> Self {
        Self {
            pattern,
            key_prefix: key_prefix.into(),
            policy,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    rules: Vec<Rule>,
}

/// Ordered rule list. The first rule whose pattern matches a path governs it,
/// so endpoint-specific rules must precede catch-all prefixes.
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<Rule>,
}

impl RuleTable {
    pub fn new(rules: Vec<Rule>) -> ThrottlerResult<Self> {
        for rule in &rules {
            rule.validate()?;
        }
        Ok(Self { rules })
    }

    /// Built-in policies for the sensitive endpoint classes.
    pub fn default_table() -> ThrottlerResult<Self> {
        let minute = Duration::from_secs(60);

        Self::new(vec![
            Rule::new(
                PathPattern::regex(r"^/api/auth(/|$)")?,
                "auth",
                Policy::new(Duration::from_secs(15 * 60), 5)
                    .with_message("Too many authentication attempts, please try again later."),
            ),
            Rule::new(
                PathPattern::regex(r"^/api/(payments|stripe|checkout)(/|$)")?,
                "payment",
                Policy::new(minute, 10)
                    .with_message("Too many payment requests, please try again later."),
            ),
            Rule::new(
                PathPattern::regex(r"^/api/(ai|chat)(/|$)")?,
                "ai",
                Policy::new(minute, 50)
                    .with_message("Too many AI requests, please slow down."),
            ),
            Rule::new(
                PathPattern::regex(r"^/api/(notebooks|pages)/create(/|$)")?,
                "create",
                Policy::new(minute, 30)
                    .with_message("Too many items created, please slow down."),
            ),
            Rule::new(
                PathPattern::regex(r"^/api/(friends|social)(/|$)")?,
                "social",
                Policy::new(minute, 30)
                    .with_message("Too many social actions, please slow down."),
            ),
            Rule::new(PathPattern::prefix("/api/"), "general", Policy::new(minute, 100)),
        ])
    }

    pub fn from_json_str(json: &str) -> ThrottlerResult<Self> {
        let file: RuleFile = serde_json::from_str(json)?;
        Self::new(file.rules)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> ThrottlerResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let table = Self::from_json_str(&json)?;
        if table.is_empty() {
            return Err(ThrottlerError::Configuration(format!(
                "Rules file {} declares no rules",
                path.display()
            )));
        }
        Ok(table)
    }

    /// Return the rule governing `path`, or `None` when it is unthrottled.
    pub fn match_path(&self, path: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.pattern.is_match(path))
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
