// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Balance-intent classification.
//!
//! A cheap text classifier that answers one question: is the user asking
//! about their balance?  Matching is deliberately forgiving — typo'd words
//! within 30% Levenshtein distance of a balance term count — but gated by a
//! context word so ordinary sentences that merely mention sats fall through
//! to the AI.  Explicit profile/identity phrasings are excluded outright,
//! since "what is my name" must reach the model, not the wallet.

use std::sync::OnceLock;

use regex::Regex;

/// Words that indicate the question is about funds.
const BALANCE_TERMS: &[&str] = &["balance", "credit", "wallet", "sats"];

/// Words that make a balance term a question about *my* funds.
const CONTEXT_TERMS: &[&str] = &["my", "check", "show", "what", "how much", "how many", "?"];

/// Phrasings that must always reach the AI path.
const EXCLUSION_TERMS: &[&str] = &[
    "identity",
    "nip05",
    "profile",
    "name",
    "who am i",
    "about me",
    "information about me",
];

fn one_word_query() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(balance|bal|credits?|wallet|sats?)\s*[?!.]*\s*$")
            .expect("static regex compiles")
    })
}

/// Maximum edit distance for a fuzzy hit: 30% of the target length.
fn fuzzy_matches(word: &str, target: &str) -> bool {
    let budget = (target.len() as f64 * 0.3).floor() as usize;
    strsim::levenshtein(word, target) <= budget
}

pub fn is_balance_intent(text: &str) -> bool {
    let lower = text.to_lowercase();

    if EXCLUSION_TERMS.iter().any(|t| lower.contains(t)) {
        return false;
    }

    if one_word_query().is_match(&lower) {
        return true;
    }

    let has_context = CONTEXT_TERMS.iter().any(|t| lower.contains(t));
    if !has_context {
        return false;
    }

    lower
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .any(|word| BALANCE_TERMS.iter().any(|target| fuzzy_matches(word, target)))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_balance_questions_match() {
        assert!(is_balance_intent("what is my balance"));
        assert!(is_balance_intent("check my balance please"));
        assert!(is_balance_intent("how many sats do I have?"));
        assert!(is_balance_intent("show wallet"));
    }

    #[test]
    fn typos_within_budget_match() {
        assert!(is_balance_intent("chek my balnce?"));
        assert!(is_balance_intent("my ballance"));
        assert!(is_balance_intent("what's my balanse"));
    }

    #[test]
    fn one_word_queries_match_without_context() {
        assert!(is_balance_intent("balance"));
        assert!(is_balance_intent("  sats?  "));
        assert!(is_balance_intent("credits!"));
        assert!(is_balance_intent("bal"));
    }

    #[test]
    fn balance_terms_without_context_fall_through() {
        assert!(!is_balance_intent("I traded some sats yesterday"));
        assert!(!is_balance_intent("tell me a story involving a wallet"));
    }

    #[test]
    fn profile_questions_are_excluded() {
        assert!(!is_balance_intent("tell me about my profile"));
        assert!(!is_balance_intent("what is my name?"));
        assert!(!is_balance_intent("who am i"));
        assert!(!is_balance_intent("check my nip05 please"));
        assert!(!is_balance_intent("show information about me"));
    }

    #[test]
    fn ordinary_questions_fall_through() {
        assert!(!is_balance_intent("what is the capital of France?"));
        assert!(!is_balance_intent("hello there"));
        assert!(!is_balance_intent(""));
    }

    #[test]
    fn fuzzy_budget_is_thirty_percent() {
        // "balance" (7 chars) → budget 2.
        assert!(fuzzy_matches("balnce", "balance")); // distance 1
        assert!(fuzzy_matches("balanc", "balance")); // distance 1
        assert!(!fuzzy_matches("blnc", "balance")); // distance 3
        // "sats" (4 chars) → budget 1.
        assert!(fuzzy_matches("sat", "sats"));
        assert!(!fuzzy_matches("stats ok", "sats"));
    }
}
