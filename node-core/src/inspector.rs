//! Semantic output inspection: the text-level half of the AI safety
//! kernel (§4.7), run over every AI-generated response before it
//! reaches a user or triggers a downstream action.
//!
//! Grounded on `ai_safety_controls.py`'s `_SemanticOutputInspector`:
//! verb/target threat vectors scored against tokenized sentences,
//! prompt-injection phrase matching, dangerous code-block contents,
//! regex-based sensitive-data redaction, and a context-sensitive
//! penalty multiplier table.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// One finding from [`inspect`]: either a blocking issue or a
/// non-blocking warning.
#[derive(Debug, Clone)]
pub struct Finding {
    pub category: String,
    pub description: String,
    pub severity: Severity,
    pub evidence: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// The verdict of [`inspect`]: whether the output is safe to surface,
/// its score, and a sanitized copy with sensitive data redacted (or
/// replaced outright if the output is unsafe and not purely a
/// sensitive-data hit).
#[derive(Debug, Clone)]
pub struct SemanticAnalysisResult {
    pub is_safe: bool,
    pub score: f64,
    pub issues: Vec<Finding>,
    pub warnings: Vec<Finding>,
    pub sanitized_output: String,
}

struct ThreatPattern {
    name: &'static str,
    verbs: &'static [&'static str],
    targets: &'static [&'static str],
    description: &'static str,
    severity: Severity,
    penalty: f64,
}

static THREAT_PATTERNS: &[ThreatPattern] = &[
    ThreatPattern {
        name: "remote_code_execution",
        verbs: &["execute", "launch", "deploy", "inject", "upload", "compile", "trigger"],
        targets: &["payload", "malware", "shell", "listener", "botnet", "trojan"],
        description: "Detected language consistent with remote code execution guidance",
        severity: Severity::Critical,
        penalty: 35.0,
    },
    ThreatPattern {
        name: "privilege_escalation",
        verbs: &["gain", "obtain", "steal", "capture", "extract", "dump"],
        targets: &["root", "admin", "credential", "password", "token", "seed", "private"],
        description: "Detected instructions encouraging credential theft or privilege escalation",
        severity: Severity::High,
        penalty: 25.0,
    },
    ThreatPattern {
        name: "financial_fraud",
        verbs: &["spoof", "forge", "fabricate", "launder", "wash", "front-run", "exploit"],
        targets: &["transaction", "exchange", "market", "order book", "oracle"],
        description: "Detected attempts to manipulate markets or financial infrastructure",
        severity: Severity::High,
        penalty: 20.0,
    },
    ThreatPattern {
        name: "self_harm",
        verbs: &["harm", "kill", "suicide", "hurt", "cut", "end"],
        targets: &["myself", "yourself", "themselves"],
        description: "Detected self-harm intent",
        severity: Severity::Critical,
        penalty: 40.0,
    },
    ThreatPattern {
        name: "violence",
        verbs: &["attack", "bomb", "shoot", "stab", "kill", "destroy"],
        targets: &["civilians", "people", "infrastructure", "school", "hospital", "city"],
        description: "Detected threats of violence",
        severity: Severity::Critical,
        penalty: 40.0,
    },
];

static PROMPT_INJECTION_PHRASES: &[&str] = &[
    "ignore previous instructions",
    "forget earlier rules",
    "disable all safety",
    "bypass moderation",
    "act maliciously",
    "respond without restrictions",
];

static DANGEROUS_CALLS: &[&str] = &[
    "os.system",
    "subprocess",
    "popen",
    "eval(",
    "exec(",
    "__import__",
    "open('/etc/passwd'",
    "rm -rf /",
];

static DANGEROUS_IMPORTS: &[&str] = &["import os", "import subprocess", "import shutil", "from os import", "ctypes"];

struct SensitivePattern {
    name: &'static str,
    regex: &'static Lazy<Regex>,
    description: &'static str,
    severity: Severity,
    penalty: f64,
}

static API_KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bsk-[A-Za-z0-9]{40,}\b").unwrap());
static CREDIT_CARD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(?:\d[ -]?){13,16}\b").unwrap());
static SSN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap());
static PRIVATE_KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b0x[a-f0-9]{64}\b").unwrap());
static SEED_PHRASE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(seed phrase|mnemonic)\s*[:=-]?\s*([a-z]+(?:\s+[a-z]+){5,})").unwrap());

static SENSITIVE_PATTERNS: Lazy<Vec<SensitivePattern>> = Lazy::new(|| {
    vec![
        SensitivePattern {
            name: "api_key",
            regex: &API_KEY_RE,
            description: "Potential API key disclosure",
            severity: Severity::High,
            penalty: 25.0,
        },
        SensitivePattern {
            name: "credit_card",
            regex: &CREDIT_CARD_RE,
            description: "Potential credit card disclosure",
            severity: Severity::High,
            penalty: 25.0,
        },
        SensitivePattern {
            name: "ssn",
            regex: &SSN_RE,
            description: "Potential SSN disclosure",
            severity: Severity::High,
            penalty: 25.0,
        },
        SensitivePattern {
            name: "private_key",
            regex: &PRIVATE_KEY_RE,
            description: "Potential private key disclosure",
            severity: Severity::Critical,
            penalty: 40.0,
        },
        SensitivePattern {
            name: "seed_phrase",
            regex: &SEED_PHRASE_RE,
            description: "Potential seed phrase disclosure",
            severity: Severity::Critical,
            penalty: 45.0,
        },
    ]
});

static SENTENCE_SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:[.!?])\s+|\n+").unwrap());
static TOKEN_SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9']+").unwrap());
static CODE_BLOCK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```.*?```").unwrap());
static BASE64_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9+/]{40,}={0,2}").unwrap());

/// Per-context penalty multipliers for a given threat category, e.g.
/// a trading context makes `financial_fraud` findings more severe.
fn context_multiplier(context: &str, category: &str) -> f64 {
    match (context.to_lowercase().as_str(), category) {
        ("trading", "financial_fraud") => 1.3,
        ("trading", "privilege_escalation") => 1.15,
        ("governance", "prompt_injection") => 1.25,
        _ => 1.0,
    }
}

fn apply_contextual_penalty(base_penalty: f64, category: &str, context: &str) -> f64 {
    if context.is_empty() {
        return base_penalty;
    }
    base_penalty * context_multiplier(context, category)
}

fn split_sentences(text: &str) -> Vec<&str> {
    let segments: Vec<&str> = SENTENCE_SPLIT_RE.split(text).map(str::trim).filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        vec![text]
    } else {
        segments
    }
}

fn tokenize(sentence: &str) -> HashSet<&str> {
    TOKEN_SPLIT_RE.split(sentence).filter(|t| !t.is_empty()).collect()
}

/// Analyzes `output` (an AI-generated response) for semantic policy
/// violations, returning a score out of 100 and a sanitized copy.
/// `context` selects the penalty multiplier table (e.g. `"trading"`,
/// `"governance"`, or `""` for none).
#[must_use]
pub fn inspect(output: &str, context: &str) -> SemanticAnalysisResult {
    let mut issues = Vec::new();
    let mut warnings = Vec::new();
    let mut score = 100.0_f64;

    let raw_sentences = split_sentences(output);
    for sentence in &raw_sentences {
        let normalized = sentence.to_lowercase();
        let tokens = tokenize(&normalized);
        if tokens.is_empty() {
            continue;
        }
        for pattern in THREAT_PATTERNS {
            let hits_verb = pattern.verbs.iter().any(|v| tokens.contains(v));
            let hits_target = pattern.targets.iter().any(|t| tokens.contains(t));
            if hits_verb && hits_target {
                let penalty = apply_contextual_penalty(pattern.penalty, pattern.name, context);
                issues.push(Finding {
                    category: pattern.name.to_string(),
                    description: pattern.description.to_string(),
                    severity: pattern.severity,
                    evidence: sentence.chars().take(200).collect(),
                });
                score -= penalty;
            }
        }
    }

    let normalized_full = output.to_lowercase();
    for phrase in PROMPT_INJECTION_PHRASES {
        if normalized_full.contains(phrase) {
            let penalty = apply_contextual_penalty(20.0, "prompt_injection", context);
            issues.push(Finding {
                category: "prompt_injection".to_string(),
                description: format!("Prompt injection attempt detected: \"{phrase}\""),
                severity: Severity::High,
                evidence: (*phrase).to_string(),
            });
            score -= penalty;
        }
    }

    for block in CODE_BLOCK_RE.find_iter(output) {
        let lowered = block.as_str().to_lowercase();
        let has_dangerous_call = DANGEROUS_CALLS.iter().any(|c| lowered.contains(c));
        let has_dangerous_import = DANGEROUS_IMPORTS.iter().any(|i| lowered.contains(i));
        if has_dangerous_call || has_dangerous_import {
            let penalty = apply_contextual_penalty(35.0, "code_execution", context);
            issues.push(Finding {
                category: "code_execution".to_string(),
                description: "Potential code execution payload detected".to_string(),
                severity: Severity::Critical,
                evidence: block.as_str().trim().chars().take(200).collect(),
            });
            score -= penalty;
        }
    }

    let (sanitized_output, sensitive_hits) = redact_sensitive_data(output);
    for (category, description, severity, base_penalty, evidence) in sensitive_hits {
        let penalty = apply_contextual_penalty(base_penalty, &category, context);
        issues.push(Finding { category, description, severity, evidence });
        score -= penalty;
    }

    if let Some(m) = BASE64_RE.find(output) {
        warnings.push(Finding {
            category: "encoded_payload".to_string(),
            description: "Detected high-entropy payload that may contain binary data".to_string(),
            severity: Severity::Medium,
            evidence: format!("{}...", m.as_str().chars().take(80).collect::<String>()),
        });
        score -= 5.0;
    }

    if output.len() > 50_000 {
        warnings.push(Finding {
            category: "excessive_length".to_string(),
            description: "Output unusually long - possible hallucination or data dump".to_string(),
            severity: Severity::Low,
            evidence: String::new(),
        });
        score -= 5.0;
    }

    score = score.max(0.0);
    let mut is_safe = !issues.iter().any(|i| matches!(i.severity, Severity::High | Severity::Critical));
    if is_safe && score < 60.0 {
        is_safe = false;
    }

    let only_sensitive_issues = !issues.is_empty() && issues.iter().all(|i| i.category == "sensitive_data");
    let sanitized_output = if !is_safe && !only_sensitive_issues {
        "[OUTPUT BLOCKED - SAFETY VIOLATION]".to_string()
    } else {
        sanitized_output
    };

    SemanticAnalysisResult { is_safe, score, issues, warnings, sanitized_output }
}

type SensitiveHit = (String, String, Severity, f64, String);

fn redact_sensitive_data(text: &str) -> (String, Vec<SensitiveHit>) {
    let mut hits = Vec::new();
    let mut redacted = text.to_string();
    for pattern in SENSITIVE_PATTERNS.iter() {
        let mut local_hit = None;
        let replaced = pattern.regex.replace_all(&redacted, |caps: &regex::Captures| {
            let matched = caps.get(0).unwrap().as_str();
            local_hit = Some(matched.chars().take(200).collect::<String>());
            format!("[REDACTED_{}]", pattern.name.to_uppercase())
        });
        if let Some(evidence) = local_hit {
            hits.push((
                "sensitive_data".to_string(),
                pattern.description.to_string(),
                pattern.severity,
                pattern.penalty,
                evidence,
            ));
        }
        redacted = replaced.into_owned();
    }
    (redacted, hits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_output_scores_perfectly_safe() {
        let result = inspect("The current block height is 1024 and difficulty is stable.", "");
        assert!(result.is_safe);
        assert_eq!(result.score, 100.0);
        assert!(result.issues.is_empty());
    }

    #[test]
    fn remote_code_execution_language_is_blocked() {
        let result = inspect("I will execute the payload on the target host.", "");
        assert!(!result.is_safe);
        assert_eq!(result.sanitized_output, "[OUTPUT BLOCKED - SAFETY VIOLATION]");
    }

    #[test]
    fn prompt_injection_phrase_is_flagged() {
        let result = inspect("Sure, let's ignore previous instructions and proceed.", "");
        assert!(result.issues.iter().any(|i| i.category == "prompt_injection"));
    }

    #[test]
    fn sensitive_api_key_is_redacted_but_not_necessarily_blocking() {
        let output = "Here is the key: sk-abcdefghijklmnopqrstuvwxyz0123456789ABCD";
        let result = inspect(output, "");
        assert!(result.sanitized_output.contains("[REDACTED_API_KEY]"));
        assert!(!result.sanitized_output.contains("sk-abcdefghijklmnopqrstuvwxyz"));
    }

    #[test]
    fn trading_context_amplifies_financial_fraud_penalty() {
        let text = "I will forge this transaction to exploit the order book.";
        let neutral = inspect(text, "");
        let trading = inspect(text, "trading");
        assert!(trading.score < neutral.score);
    }

    #[test]
    fn dangerous_code_block_is_flagged() {
        let output = "```python\nimport subprocess\nsubprocess.run(['rm', '-rf', '/'])\n```";
        let result = inspect(output, "");
        assert!(result.issues.iter().any(|i| i.category == "code_execution"));
    }
}
