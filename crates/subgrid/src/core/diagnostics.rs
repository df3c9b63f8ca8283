//! Heuristic classification of failed service calls.
//!
//! Classification is driven by an ordered rule table: each rule pairs a
//! matcher over the failure message or status with a kind and suggestion
//! templates. Rules are independent, so one failure can match several kinds.
//! Templates support `{0}` (first regex capture) and the `{entity}`,
//! `{parent}`, `{child}` context placeholders.

use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::relationship::RelationshipHealer;
use subgrid_api::{DiagnosisContext, ErrorDiagnosis, RateLimitInfo, ServiceFailure};

const CORRELATION_HEADERS: &[&str] = &["x-ms-correlation-request-id", "x-correlation-id"];
const REQUEST_ID_HEADERS: &[&str] = &["x-ms-service-request-id", "req_id", "x-ms-request-id"];
const BURST_REMAINING_HEADER: &str = "x-ms-ratelimit-burst-remaining-xrm-requests";
const TIME_REMAINING_HEADER: &str = "x-ms-ratelimit-time-remaining-xrm-requests";
const RETRY_AFTER_HEADER: &str = "retry-after";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Relationship,
    Field,
    Entity,
    Permission,
}

#[derive(Debug, Clone)]
pub enum Matcher {
    /// Case-insensitive substring of the message.
    MessageContains(String),
    /// Regex over the message; the first capture group feeds `{0}`.
    MessagePattern(Regex),
    /// Any of these HTTP statuses.
    Status(Vec<u16>),
}

impl Matcher {
    /// Returns the first capture (empty when the matcher has none) on a match.
    fn matches(&self, message: &str, status: Option<u16>) -> Option<String> {
        match self {
            Matcher::MessageContains(needle) => message
                .to_lowercase()
                .contains(&needle.to_lowercase())
                .then(String::new),
            Matcher::MessagePattern(pattern) => pattern.captures(message).map(|caps| {
                caps.get(1)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default()
            }),
            Matcher::Status(codes) => status
                .filter(|code| codes.contains(code))
                .map(|_| String::new()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub kind: ErrorKind,
    pub matcher: Matcher,
    pub suggestions: Vec<String>,
}

impl ClassificationRule {
    pub fn new<I, S>(kind: ErrorKind, matcher: Matcher, suggestions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            matcher,
            suggestions: suggestions.into_iter().map(Into::into).collect(),
        }
    }

    /// Rule over a regex; invalid patterns are reported as an error.
    pub fn pattern<I, S>(
        kind: ErrorKind,
        pattern: &str,
        suggestions: I,
    ) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(Self::new(
            kind,
            Matcher::MessagePattern(Regex::new(pattern)?),
            suggestions,
        ))
    }
}

fn builtin_rules() -> Result<Vec<ClassificationRule>, regex::Error> {
    Ok(vec![
        ClassificationRule::pattern(
            ErrorKind::Relationship,
            r"(?i)\b(_?(?:parentid|regardingobjectid)(?:_value)?)\b",
            [
                "The query references the generic parent field '{0}', which may not link '{child}' to '{parent}'",
                "Try discovering the relationship between '{parent}' and '{child}' at runtime",
            ],
        )?,
        ClassificationRule::pattern(
            ErrorKind::Relationship,
            r"(?i)could not find a property named '(_\w+_value)'",
            [
                "Lookup column '{0}' does not exist on '{entity}'; the relationship may use a different lookup field",
                "Try discovering the relationship between '{parent}' and '{child}' at runtime",
            ],
        )?,
        ClassificationRule::pattern(
            ErrorKind::Relationship,
            r"(?i)lookup (?:field|attribute|column) '?(\w+)'? (?:was )?not found",
            ["Lookup column '{0}' was not found; refresh the metadata cache and rediscover the relationship"],
        )?,
        ClassificationRule::pattern(
            ErrorKind::Field,
            r"(?i)could not find a property named '([^']+)'",
            [
                "Field '{0}' does not exist on '{entity}'; check spelling or the entity schema",
                "Remove '{0}' from the requested fields or clear the metadata cache",
            ],
        )?,
        ClassificationRule::pattern(
            ErrorKind::Entity,
            r"(?i)resource not found for the segment '([^']+)'",
            [
                "'{0}' is not a valid collection; check the entity set name of '{entity}'",
                "Clear the metadata cache and retry if the entity was created recently",
            ],
        )?,
        ClassificationRule::pattern(
            ErrorKind::Entity,
            r"(?i)could not find (?:an )?entity (?:with (?:logical )?name )?'?(\w+)'?",
            ["Entity '{0}' does not exist or is not visible to the current user"],
        )?,
        ClassificationRule::new(
            ErrorKind::Permission,
            Matcher::Status(vec![401]),
            ["Authentication failed; sign in again or refresh the access token"],
        ),
        ClassificationRule::new(
            ErrorKind::Permission,
            Matcher::Status(vec![403]),
            ["The current user lacks privileges on '{entity}'; ask an administrator for read access"],
        ),
        ClassificationRule::pattern(
            ErrorKind::Permission,
            r"(?i)missing (prv\w+) privilege",
            ["Grant the '{0}' privilege to one of the user's security roles"],
        )?,
    ])
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorPayload>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorPayload {
    code: Option<String>,
    message: Option<String>,
}

/// Best-effort parse of `{"error": {"code", "message"}}`.
fn parse_body(body: &str) -> Option<ErrorPayload> {
    serde_json::from_str::<ErrorEnvelope>(body).ok()?.error
}

fn first_header(failure: &ServiceFailure, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| failure.header(name))
        .map(str::to_string)
}

fn header_number(failure: &ServiceFailure, name: &str) -> Option<u64> {
    failure.header(name).and_then(|v| v.trim().parse().ok())
}

fn render(template: &str, capture: &str, context: Option<&DiagnosisContext>) -> String {
    let entity = context
        .and_then(|c| c.entity_logical_name.as_deref().or(c.child_entity.as_deref()))
        .unwrap_or("the entity");
    let parent = context
        .and_then(|c| c.parent_entity.as_deref())
        .unwrap_or("the parent entity");
    let child = context
        .and_then(|c| c.child_entity.as_deref().or(c.entity_logical_name.as_deref()))
        .unwrap_or("the child entity");
    template
        .replace("{0}", capture)
        .replace("{entity}", entity)
        .replace("{parent}", parent)
        .replace("{child}", child)
}

pub struct ErrorClassifier {
    rules: Vec<ClassificationRule>,
    healer: Option<Arc<dyn RelationshipHealer>>,
    history: Mutex<VecDeque<ErrorDiagnosis>>,
    history_limit: usize,
}

impl ErrorClassifier {
    /// Classifier with the built-in rule table.
    pub fn new() -> Self {
        // The built-in patterns are literals covered by tests.
        let rules = builtin_rules().unwrap_or_default();
        Self::with_rules(rules)
    }

    pub fn with_rules(rules: Vec<ClassificationRule>) -> Self {
        Self {
            rules,
            healer: None,
            history: Mutex::new(VecDeque::new()),
            history_limit: 100,
        }
    }

    /// Enable the self-healing path: relationship errors with a known
    /// parent and child trigger a fresh discovery.
    pub fn with_healer(mut self, healer: Arc<dyn RelationshipHealer>) -> Self {
        self.healer = Some(healer);
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Append a rule after the existing ones.
    pub fn add_rule(&mut self, rule: ClassificationRule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    /// Classify one failure and record it in the history.
    pub async fn classify(
        &self,
        failure: &ServiceFailure,
        context: Option<&DiagnosisContext>,
    ) -> ErrorDiagnosis {
        let mut diagnosis = ErrorDiagnosis::empty();
        diagnosis.status = failure.status;

        match failure.body.as_deref() {
            Some(body) => {
                if let Some(payload) = parse_body(body) {
                    diagnosis.error_code = payload.code;
                    diagnosis.error_message = payload.message;
                } else {
                    debug!("[ErrorClassifier] Response body is not an error envelope");
                }
            }
            None => diagnosis.error_message = Some(failure.message.clone()),
        }

        let text = match diagnosis.error_message.as_deref() {
            Some(message) if message != failure.message => format!("{message}\n{}", failure.message),
            _ => failure.message.clone(),
        };

        for rule in &self.rules {
            let Some(capture) = rule.matcher.matches(&text, failure.status) else {
                continue;
            };
            match rule.kind {
                ErrorKind::Relationship => diagnosis.is_relationship_error = true,
                ErrorKind::Field => diagnosis.is_field_error = true,
                ErrorKind::Entity => diagnosis.is_entity_error = true,
                ErrorKind::Permission => diagnosis.is_permission_error = true,
            }
            for template in &rule.suggestions {
                let suggestion = render(template, &capture, context);
                if !diagnosis.suggestions.contains(&suggestion) {
                    diagnosis.suggestions.push(suggestion);
                }
            }
        }

        if diagnosis.is_relationship_error {
            if let Some(healed) = self.heal(context).await {
                diagnosis.suggestions.insert(0, healed);
            }
        }

        diagnosis.correlation_id = first_header(failure, CORRELATION_HEADERS);
        diagnosis.request_id = first_header(failure, REQUEST_ID_HEADERS);
        let rate_limit = RateLimitInfo {
            burst_remaining: header_number(failure, BURST_REMAINING_HEADER),
            time_remaining: header_number(failure, TIME_REMAINING_HEADER),
            retry_after_secs: header_number(failure, RETRY_AFTER_HEADER),
        };
        diagnosis.rate_limit = (!rate_limit.is_empty()).then_some(rate_limit);

        info!(
            "[ErrorClassifier] {} classified as [{}] with {} suggestions",
            failure.kind,
            diagnosis.classifications().join(", "),
            diagnosis.suggestions.len()
        );
        self.record(diagnosis.clone());
        diagnosis
    }

    async fn heal(&self, context: Option<&DiagnosisContext>) -> Option<String> {
        let healer = self.healer.as_ref()?;
        let context = context?;
        let parent = context.parent_entity.as_deref()?;
        let child = context.child_entity.as_deref()?;

        debug!("[ErrorClassifier] Rediscovering {} -> {}", parent, child);
        Some(match healer.rediscover(parent, child).await {
            Some(found) => format!(
                "Discovered relationship from '{}' to '{}' via lookup column '{}' (confidence: {}, source: {}); retry with this column",
                parent, child, found.lookup_column, found.confidence, found.source
            ),
            None => format!(
                "Automatic discovery found no lookup column from '{child}' to '{parent}'"
            ),
        })
    }

    fn record(&self, diagnosis: ErrorDiagnosis) {
        let mut history = self.history.lock();
        history.push_back(diagnosis);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    /// Classify and render a report for display.
    pub async fn describe(
        &self,
        failure: &ServiceFailure,
        context: Option<&DiagnosisContext>,
    ) -> String {
        let diagnosis = self.classify(failure, context).await;
        Self::report(failure, &diagnosis)
    }

    /// Human-readable report of a diagnosis.
    pub fn report(failure: &ServiceFailure, diagnosis: &ErrorDiagnosis) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Request failed: {failure}");
        if let Some(status) = diagnosis.status {
            let _ = writeln!(out, "Status: {status}");
        }
        if let Some(code) = &diagnosis.error_code {
            let _ = writeln!(out, "Error code: {code}");
        }
        if let Some(message) = &diagnosis.error_message {
            let _ = writeln!(out, "Message: {message}");
        }
        let classifications = diagnosis.classifications();
        if classifications.is_empty() {
            let _ = writeln!(out, "Classification: unclassified");
        } else {
            let _ = writeln!(out, "Classification: {}", classifications.join(", "));
        }
        if !diagnosis.suggestions.is_empty() {
            let _ = writeln!(out, "Suggestions:");
            for (index, suggestion) in diagnosis.suggestions.iter().enumerate() {
                let _ = writeln!(out, "  {}. {}", index + 1, suggestion);
            }
        }
        if let Some(id) = &diagnosis.correlation_id {
            let _ = writeln!(out, "Correlation id: {id}");
        }
        if let Some(id) = &diagnosis.request_id {
            let _ = writeln!(out, "Request id: {id}");
        }
        if let Some(limits) = &diagnosis.rate_limit {
            let fmt = |v: Option<u64>| v.map_or_else(|| "-".to_string(), |v| v.to_string());
            let _ = writeln!(
                out,
                "Rate limit: burst remaining {}, time remaining {}, retry after {}s",
                fmt(limits.burst_remaining),
                fmt(limits.time_remaining),
                fmt(limits.retry_after_secs)
            );
        }
        let _ = writeln!(out, "At: {}", diagnosis.timestamp.to_rfc3339());
        out
    }

    /// Recorded diagnoses, oldest first.
    pub fn history(&self) -> Vec<ErrorDiagnosis> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}
