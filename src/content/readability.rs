//! Readability and linguistic analysis of lesson text
//!
//! Heuristic, dictionary-free metrics: Flesch-Kincaid grade from a vowel-group
//! syllable count, complex-word density, academic jargon markers and structure.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[a-zA-Z]+\b").unwrap());

static JARGON_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"\b(therefore|hence|thus|wherein|whereby|herein)\b").unwrap(),
        Regex::new(r"\b(aforementioned|notwithstanding|pursuant)\b").unwrap(),
        Regex::new(r"\b(paradigm|methodology|framework|implementation)\b").unwrap(),
        Regex::new(r"\b(utilizing|commenced|terminated|facilitated)\b").unwrap(),
    ]
});

static LIST_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*([-•*]|\d+\.)\s+").unwrap());

const EXAMPLE_MARKERS: [&str; 5] = ["for example", "e.g.", "for instance", "such as", "example:"];

/// Words per minute assumed for reading-time estimates
const READING_WPM: f64 = 200.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityLevel {
    Simple,
    Moderate,
    Complex,
}

impl ComplexityLevel {
    pub fn from_grade(grade: f64) -> Self {
        if grade <= 6.0 {
            ComplexityLevel::Simple
        } else if grade <= 10.0 {
            ComplexityLevel::Moderate
        } else {
            ComplexityLevel::Complex
        }
    }
}

/// Full analysis used by the `analyze-content` command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextReport {
    pub flesch_kincaid_grade: f64,
    pub complexity_level: ComplexityLevel,
    pub word_count: usize,
    pub sentence_count: usize,
    pub avg_words_per_sentence: f64,
    pub complex_words: Vec<String>,
    pub jargon_terms: Vec<String>,
    pub long_sentences: usize,
    pub reading_minutes: f64,
}

pub fn words(text: &str) -> Vec<&str> {
    WORD.find_iter(text).map(|m| m.as_str()).collect()
}

/// Split on terminal punctuation followed by whitespace, keeping the punctuation
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        let terminal = matches!(c, '.' | '!' | '?');
        if terminal && chars.peek().map_or(true, |next| next.is_whitespace()) {
            let sentence = current.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            current.clear();
        }
    }

    let rest = current.trim();
    if !rest.is_empty() {
        sentences.push(rest.to_string());
    }
    sentences
}

pub fn sentence_count(text: &str) -> usize {
    split_sentences(text)
        .iter()
        .filter(|s| s.chars().any(|c| c.is_alphanumeric()))
        .count()
        .max(1)
}

/// Vowel-group syllable estimate
pub fn syllables(word: &str) -> usize {
    let lower = word.to_lowercase();
    let mut count = 0;
    let mut prev_vowel = false;
    for c in lower.chars() {
        let vowel = matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y');
        if vowel && !prev_vowel {
            count += 1;
        }
        prev_vowel = vowel;
    }

    // Silent trailing e ("make"), but not "-le" ("table")
    if lower.ends_with('e') && !lower.ends_with("le") && count > 1 {
        count -= 1;
    }
    count.max(1)
}

pub fn flesch_kincaid_grade(text: &str) -> f64 {
    if text.trim().len() < 10 {
        return 0.0;
    }
    let words = words(text);
    if words.is_empty() {
        return 0.0;
    }

    let word_count = words.len() as f64;
    let syllable_count: usize = words.iter().map(|w| syllables(w)).sum();
    let sentences = sentence_count(text) as f64;

    let grade = 0.39 * (word_count / sentences) + 11.8 * (syllable_count as f64 / word_count) - 15.59;
    grade.max(0.0)
}

/// Unique lowercase words with at least `min_syllables` syllables, sorted
pub fn complex_words(text: &str, min_syllables: usize) -> Vec<String> {
    let mut found: Vec<String> = words(text)
        .into_iter()
        .map(|w| w.to_lowercase())
        .filter(|w| syllables(w) >= min_syllables)
        .collect();
    found.sort();
    found.dedup();
    found
}

pub fn jargon_terms(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut found: Vec<String> = JARGON_PATTERNS
        .iter()
        .flat_map(|re| re.find_iter(&lower).map(|m| m.as_str().to_string()).collect::<Vec<_>>())
        .collect();
    found.sort();
    found.dedup();
    found
}

pub fn has_examples(text: &str) -> bool {
    let lower = text.to_lowercase();
    EXAMPLE_MARKERS.iter().any(|marker| lower.contains(marker))
}

pub fn is_structured(text: &str) -> bool {
    LIST_LINE.is_match(text) || text.contains("\n\n")
}

pub fn long_sentence_count(text: &str, max_words: usize) -> usize {
    split_sentences(text)
        .iter()
        .filter(|s| words(s).len() > max_words)
        .count()
}

pub fn analyze(text: &str) -> TextReport {
    let grade = flesch_kincaid_grade(text);
    let word_count = words(text).len();
    let sentence_count = sentence_count(text);

    let mut complex = complex_words(text, 3);
    complex.truncate(10);

    TextReport {
        flesch_kincaid_grade: grade,
        complexity_level: ComplexityLevel::from_grade(grade),
        word_count,
        sentence_count,
        avg_words_per_sentence: word_count as f64 / sentence_count as f64,
        complex_words: complex,
        jargon_terms: jargon_terms(text),
        long_sentences: long_sentence_count(text, 30),
        reading_minutes: (word_count as f64 / READING_WPM * 10.0).round() / 10.0,
    }
}
