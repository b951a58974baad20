use std::env;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use concierge_core::Chunk;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const GROUNDING_FAILURE_MESSAGE: &str = "I cannot answer that from the available documents: \
the question needs grounding in our internal sources, but no relevant documents were retrieved.";

const GENERIC_REFUSAL: &str = "I cannot assist with this request.";
const MAX_SYMLINK_HOPS: usize = 40;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RefusalCategory {
    Legal,
    Medical,
    Financial,
    DocumentGeneration,
}

impl RefusalCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Legal => "legal",
            Self::Medical => "medical",
            Self::Financial => "financial",
            Self::DocumentGeneration => "document_generation",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "legal" => Some(Self::Legal),
            "medical" => Some(Self::Medical),
            "financial" => Some(Self::Financial),
            "document_generation" => Some(Self::DocumentGeneration),
            _ => None,
        }
    }
}

impl fmt::Display for RefusalCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GuardViolation {
    #[error("{}", GROUNDING_FAILURE_MESSAGE)]
    Ungrounded,
    #[error("Path {path} is outside sandbox directory {root}")]
    OutsideSandbox { path: String, root: String },
    #[error("Invalid path: {reason}")]
    InvalidPath { reason: String },
}

impl GuardViolation {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Ungrounded => "grounding_required",
            Self::OutsideSandbox { .. } => "path_outside_sandbox",
            Self::InvalidPath { .. } => "invalid_path",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow { masked_query: String },
    Refuse { category: RefusalCategory, user_message: String },
    Deny { violation: GuardViolation, masked_query: String },
}

impl GuardrailDecision {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }

    /// The message shown to the user when the guard did not pass.
    pub fn user_message(&self) -> Option<String> {
        match self {
            Self::Allow { .. } => None,
            Self::Refuse { user_message, .. } => Some(user_message.clone()),
            Self::Deny { violation, .. } => Some(violation.to_string()),
        }
    }

    /// Refusals short-circuit before masking, so they carry no masked query.
    pub fn masked_query(&self) -> Option<&str> {
        match self {
            Self::Allow { masked_query } | Self::Deny { masked_query, .. } => Some(masked_query),
            Self::Refuse { .. } => None,
        }
    }
}

struct RefusalPattern {
    category: RefusalCategory,
    regex: Regex,
}

struct PiiPattern {
    placeholder: &'static str,
    regex: Regex,
}

fn refusal_patterns() -> &'static [RefusalPattern] {
    static PATTERNS: OnceLock<Vec<RefusalPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (
                RefusalCategory::Legal,
                r"(?i)legal advice|lawyer|legal counsel|sue|lawsuit|legal opinion",
            ),
            (
                RefusalCategory::Medical,
                r"(?i)medical advice|diagnose|prescription|treatment|doctor|symptom|disease|medicine",
            ),
            (
                RefusalCategory::Financial,
                r"(?i)financial advice|investment|trading|stock pick|buy.*stock|sell.*stock",
            ),
            (
                RefusalCategory::DocumentGeneration,
                r"(?i)generate.*letter|write.*contract|draft.*document|create.*legal",
            ),
        ]
        .into_iter()
        .filter_map(|(category, pattern)| {
            Regex::new(pattern).ok().map(|regex| RefusalPattern { category, regex })
        })
        .collect()
    })
}

fn pii_patterns() -> &'static [PiiPattern] {
    static PATTERNS: OnceLock<Vec<PiiPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            ("[REDACTED_EMAIL]", r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Z|a-z]{2,}\b"),
            ("[REDACTED_SSN]", r"\b\d{3}-\d{2}-\d{4}\b"),
            ("[REDACTED_PHONE]", r"\b\d{3}\.\d{3}\.\d{4}\b"),
            ("[REDACTED_CREDIT_CARD]", r"\b\d{16}\b"),
        ]
        .into_iter()
        .filter_map(|(placeholder, pattern)| {
            Regex::new(pattern).ok().map(|regex| PiiPattern { placeholder, regex })
        })
        .collect()
    })
}

fn factual_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)what is|how much|when|where|who|explain|describe",
            r"(?i)policy|procedure|allowance|rate|formula",
        ]
        .into_iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// First matching category wins; the table order is legal, medical, financial, document generation.
pub fn classify_refusal(query: &str) -> Option<RefusalCategory> {
    let category = refusal_patterns()
        .iter()
        .find(|pattern| pattern.regex.is_match(query))
        .map(|pattern| pattern.category);
    match category {
        Some(category) => info!(event_name = "guard.refused", category = %category, "query matched refusal pattern"),
        None => debug!(event_name = "guard.refusal_clear", "query passed refusal check"),
    }
    category
}

/// Replaces emails, SSNs, dotted phone numbers and 16-digit card numbers with fixed placeholders.
pub fn mask_pii(text: &str) -> String {
    let mut masked = text.to_owned();
    let mut replaced = 0usize;
    for pattern in pii_patterns() {
        let hits = pattern.regex.find_iter(&masked).count();
        if hits > 0 {
            replaced += hits;
            masked = pattern.regex.replace_all(&masked, pattern.placeholder).into_owned();
        }
    }
    if replaced > 0 {
        info!(event_name = "guard.pii_masked", count = replaced, "masked PII in text");
    }
    masked
}

pub fn contains_pii(text: &str) -> bool {
    pii_patterns().iter().any(|pattern| pattern.regex.is_match(text))
}

/// Heuristic gate: a factual-looking query with no retrieved chunks cannot be answered.
pub fn check_grounding(query: &str, chunks: &[Chunk]) -> Result<(), GuardViolation> {
    if chunks.is_empty() && factual_patterns().iter().any(|pattern| pattern.is_match(query)) {
        warn!(event_name = "guard.ungrounded", "factual query has no retrieved chunks");
        return Err(GuardViolation::Ungrounded);
    }
    debug!(event_name = "guard.grounded", chunks = chunks.len(), "grounding check passed");
    Ok(())
}

pub fn refusal_message(category: Option<RefusalCategory>) -> &'static str {
    match category {
        Some(RefusalCategory::Legal) => {
            "I cannot provide legal advice. For legal questions, please consult with a qualified \
             attorney. I can help answer questions about company policies and procedures based on \
             our internal documents."
        }
        Some(RefusalCategory::Medical) => {
            "I cannot provide medical advice or diagnoses. For medical questions, please consult \
             with a qualified healthcare provider. I can help answer questions about company \
             policies and procedures."
        }
        Some(RefusalCategory::Financial) => {
            "I cannot provide financial or investment advice. For financial questions, please \
             consult with a qualified financial advisor. I can help answer questions about company \
             policies and procedures."
        }
        Some(RefusalCategory::DocumentGeneration) => {
            "I cannot generate legal documents, contracts, or letters. For document generation \
             needs, please consult with appropriate legal or administrative resources. I can help \
             answer questions about company policies and procedures."
        }
        None => GENERIC_REFUSAL,
    }
}

/// Maps a free-form category label to its refusal text; unknown labels get the generic refusal.
pub fn refusal_message_for_label(label: &str) -> &'static str {
    refusal_message(RefusalCategory::from_label(label))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardrailPolicy {
    pub sandbox_root: PathBuf,
}

impl Default for GuardrailPolicy {
    fn default() -> Self {
        Self { sandbox_root: PathBuf::from("data/sandbox") }
    }
}

impl GuardrailPolicy {
    pub fn new(sandbox_root: impl Into<PathBuf>) -> Self {
        Self { sandbox_root: sandbox_root.into() }
    }

    /// Resolves `path` (following every symlink it passes through) and checks it sits under the
    /// sandbox root. Returns the resolved path on success.
    pub fn validate_path(&self, path: &Path) -> Result<PathBuf, GuardViolation> {
        let root = resolve(&self.sandbox_root)?;
        let resolved = resolve(path)?;
        if resolved.starts_with(&root) {
            debug!(event_name = "guard.path_allowed", path = %resolved.display(), "path validated");
            Ok(resolved)
        } else {
            let violation = GuardViolation::OutsideSandbox {
                path: path.display().to_string(),
                root: root.display().to_string(),
            };
            warn!(event_name = "guard.path_rejected", error = %violation, "path outside sandbox");
            Err(violation)
        }
    }

    /// Refusal check, then PII masking, then grounding (only when `retrieved_chunks` is given),
    /// then each path in order. The first failing stage decides.
    pub fn apply_guards(
        &self,
        query: &str,
        retrieved_chunks: Option<&[Chunk]>,
        file_paths: &[&Path],
    ) -> GuardrailDecision {
        if let Some(category) = classify_refusal(query) {
            return GuardrailDecision::Refuse {
                category,
                user_message: refusal_message(Some(category)).to_owned(),
            };
        }

        let masked_query = mask_pii(query);

        if let Some(chunks) = retrieved_chunks {
            if let Err(violation) = check_grounding(query, chunks) {
                return GuardrailDecision::Deny { violation, masked_query };
            }
        }

        for path in file_paths {
            if let Err(violation) = self.validate_path(path) {
                return GuardrailDecision::Deny { violation, masked_query };
            }
        }

        GuardrailDecision::Allow { masked_query }
    }
}

/// Walks `path` one component at a time the way the OS would: `..` pops what has been resolved
/// so far, and every symlink met along the way is replaced by its target before the walk
/// continues. Components that do not exist yet are taken as written.
fn resolve(path: &Path) -> Result<PathBuf, GuardViolation> {
    if path.as_os_str().is_empty() {
        return Err(GuardViolation::InvalidPath { reason: "empty path".to_owned() });
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()
            .map_err(|error| GuardViolation::InvalidPath { reason: error.to_string() })?
            .join(path)
    };

    let mut pending = Vec::new();
    push_components(&mut pending, &absolute);
    let mut resolved = PathBuf::new();
    let mut links_followed = 0;

    while let Some(part) = pending.pop() {
        match Path::new(&part).components().next() {
            Some(Component::Prefix(_) | Component::RootDir) => resolved.push(&part),
            Some(Component::ParentDir) => {
                resolved.pop();
            }
            Some(Component::Normal(name)) => {
                resolved.push(name);
                let is_symlink = fs::symlink_metadata(&resolved)
                    .is_ok_and(|metadata| metadata.file_type().is_symlink());
                if !is_symlink {
                    continue;
                }

                links_followed += 1;
                if links_followed > MAX_SYMLINK_HOPS {
                    return Err(GuardViolation::InvalidPath {
                        reason: format!("too many levels of symbolic links in {}", path.display()),
                    });
                }
                let target = fs::read_link(&resolved).map_err(|error| GuardViolation::InvalidPath {
                    reason: format!("cannot read link {}: {error}", resolved.display()),
                })?;
                resolved.pop();
                push_components(&mut pending, &target);
            }
            Some(Component::CurDir) | None => {}
        }
    }

    Ok(resolved)
}

/// Queues `path`'s components so that popping yields them front to back.
fn push_components(pending: &mut Vec<OsString>, path: &Path) {
    pending.extend(path.components().rev().map(|component| component.as_os_str().to_owned()));
}
