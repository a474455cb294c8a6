//! Render an adaptation decision onto base content
//!
//! Output depends only on the decision and the text, so the same request always
//! produces the same adapted content.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use super::readability;
use crate::model::{AdaptationAction, AdaptationDecision};

/// Academic phrasing and plainer replacements; multi-word phrases come first
const PLAIN_WORDS: &[(&str, &str)] = &[
    ("due to the fact that", "because"),
    ("at this point in time", "now"),
    ("in the event that", "if"),
    ("for the purpose of", "to"),
    ("in accordance with", "following"),
    ("in addition to", "also"),
    ("with regard to", "about"),
    ("subsequent to", "after"),
    ("in order to", "to"),
    ("prior to", "before"),
    ("utilize", "use"),
    ("utilizes", "uses"),
    ("facilitate", "help"),
    ("commence", "start"),
    ("terminate", "end"),
    ("nevertheless", "but"),
    ("furthermore", "also"),
    ("consequently", "so"),
    ("approximately", "about"),
    ("sufficient", "enough"),
    ("demonstrate", "show"),
    ("indicate", "show"),
    ("obtain", "get"),
    ("require", "need"),
    ("assist", "help"),
    ("attempt", "try"),
    ("determine", "find out"),
    ("establish", "set up"),
    ("evaluate", "check"),
    ("identify", "find"),
    ("maintain", "keep"),
    ("modify", "change"),
    ("regarding", "about"),
    ("therefore", "so"),
    ("currently", "now"),
    ("additional", "more"),
    ("component", "part"),
    ("methodology", "method"),
    ("functionality", "feature"),
];

static PLAIN_WORD_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    PLAIN_WORDS
        .iter()
        .map(|(from, to)| {
            let pattern = format!(r"(?i)\b{}\b", regex::escape(from));
            (Regex::new(&pattern).unwrap(), *to)
        })
        .collect()
});

static CAPITALIZED_TERM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][a-z]+(?:\s+[A-Z][a-z]+)*\b").unwrap());

static QUOTED_TERM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""([^"]+)""#).unwrap());

/// Sentence-initial words that are not concepts
const COMMON_CAPITALS: &[&str] = &[
    "A", "An", "The", "This", "That", "These", "Those", "It", "In", "On", "For", "We", "You",
    "When", "If", "Each", "Every", "Some", "Students",
];

const MAX_CONCEPTS: usize = 5;
const OVERVIEW_CHARS: usize = 100;
const REFLECTION_PROMPT: &str = "**Pause and reflect:** What is the main point so far?";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptedContent {
    pub action: AdaptationAction,
    pub magnitude: u8,
    pub content: String,
    pub changes_made: Vec<String>,
    pub grade_before: f64,
    pub grade_after: f64,
}

/// Apply `decision` to `base_content`
pub fn generate_adaptation(decision: &AdaptationDecision, base_content: &str) -> AdaptedContent {
    let level = decision.magnitude.clamp(1, 3);
    let mut changes = Vec::new();

    let content = match decision.action {
        AdaptationAction::None => base_content.to_string(),
        AdaptationAction::Simplify => simplify(base_content, level, &mut changes),
        AdaptationAction::AddExample => add_examples(base_content, level, &mut changes),
        AdaptationAction::ChangeModality => change_modality(base_content, level, &mut changes),
    };

    AdaptedContent {
        action: decision.action,
        magnitude: decision.magnitude,
        grade_before: readability::flesch_kincaid_grade(base_content),
        grade_after: readability::flesch_kincaid_grade(&content),
        content,
        changes_made: changes,
    }
}

/// Vocabulary replacement, plus sentence splitting from level 2
pub fn simplify(text: &str, level: u8, changes: &mut Vec<String>) -> String {
    let mut simplified = text.to_string();
    let mut replaced = 0;

    for (pattern, plain) in PLAIN_WORD_PATTERNS.iter() {
        let hits = pattern.find_iter(&simplified).count();
        if hits == 0 {
            continue;
        }
        replaced += hits;
        simplified = pattern
            .replace_all(&simplified, |caps: &regex::Captures| match_case(&caps[0], plain))
            .into_owned();
    }
    if replaced > 0 {
        changes.push(format!("Simplified {} complex terms", replaced));
    }

    let max_words = match level {
        1 => None,
        2 => Some(20),
        _ => Some(12),
    };
    if let Some(max_words) = max_words {
        let (split, count) = split_long_sentences(&simplified, max_words);
        if count > 0 {
            changes.push(format!("Broke {} long sentences into shorter ones", count));
            simplified = split;
        }
    }

    if changes.is_empty() {
        changes.push("Content already uses plain wording".to_string());
    }
    simplified
}

fn add_examples(text: &str, level: u8, changes: &mut Vec<String>) -> String {
    if readability::has_examples(text) && level < 3 {
        changes.push("Content already contains examples".to_string());
        return text.to_string();
    }

    let wanted = match level {
        1 => 1,
        2 => 3,
        _ => MAX_CONCEPTS,
    };
    let concepts: Vec<String> = key_concepts(text).into_iter().take(wanted).collect();

    let mut lines = vec!["**Examples to help understand:**".to_string(), String::new()];
    if concepts.is_empty() {
        lines.push("- Think of one everyday situation where this idea shows up.".to_string());
        changes.push("Added a worked-example prompt".to_string());
    } else {
        for concept in &concepts {
            lines.push(format!(
                "- **{}**: where have you seen {} outside this lesson?",
                concept, concept
            ));
        }
        changes.push(format!("Added example section for {} key concepts", concepts.len()));
    }

    format!("{}\n\n{}", text.trim_end(), lines.join("\n"))
}

fn change_modality(text: &str, level: u8, changes: &mut Vec<String>) -> String {
    let mut result = if level >= 3 {
        let chunks = chunk(text);
        if chunks.len() > 1 {
            changes.push(format!("Divided content into {} sections", chunks.len()));
        }
        let joined = chunks.join("\n\n---\n\n");
        let with_prompt = insert_reflection(&joined);
        if with_prompt != joined {
            changes.push("Added reflection checkpoint".to_string());
        }
        with_prompt
    } else {
        let bullets = to_bullets(text);
        if bullets != text {
            changes.push("Converted dense text to bullet points".to_string());
        }
        bullets
    };

    if level >= 2 {
        if let Some(first) = readability::split_sentences(text).first() {
            let overview = truncate_chars(first, OVERVIEW_CHARS);
            result = format!("**Quick Overview:** {}\n\n---\n\n{}", overview, result);
            changes.push("Added summary introduction".to_string());
        }
    }

    if changes.is_empty() {
        changes.push("Content structure left as is".to_string());
    }
    result
}

/// Capitalized phrases, then quoted terms, in order of appearance
pub fn key_concepts(text: &str) -> Vec<String> {
    let mut concepts: Vec<String> = Vec::new();
    let candidates = CAPITALIZED_TERM
        .find_iter(text)
        .map(|m| {
            m.as_str()
                .split_whitespace()
                .skip_while(|w| COMMON_CAPITALS.contains(w))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .chain(QUOTED_TERM.captures_iter(text).map(|c| c[1].trim().to_string()));

    for candidate in candidates {
        if candidate.is_empty() {
            continue;
        }
        if !concepts.contains(&candidate) {
            concepts.push(candidate);
        }
        if concepts.len() == MAX_CONCEPTS {
            break;
        }
    }
    concepts
}

fn split_long_sentences(text: &str, max_words: usize) -> (String, usize) {
    let mut split_count = 0;
    let paragraphs: Vec<String> = text
        .split("\n\n")
        .map(|paragraph| {
            let mut out: Vec<String> = Vec::new();
            for sentence in readability::split_sentences(paragraph) {
                let words: Vec<&str> = sentence.split_whitespace().collect();
                if words.len() <= max_words {
                    out.push(sentence);
                    continue;
                }
                split_count += 1;
                let mid = words.len() / 2;
                let head = words[..mid].join(" ");
                let head = head.trim_end_matches(|c: char| c == ',' || c == ';');
                out.push(format!("{}.", head));
                out.push(capitalize(&words[mid..].join(" ")));
            }
            out.join(" ")
        })
        .collect();
    (paragraphs.join("\n\n"), split_count)
}

fn to_bullets(text: &str) -> String {
    let sentences = readability::split_sentences(text);
    if sentences.len() < 3 {
        return text.to_string();
    }
    sentences
        .iter()
        .map(|s| format!("- {}", s))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Paragraphs when there are enough of them, otherwise groups of three sentences
fn chunk(text: &str) -> Vec<String> {
    let paragraphs: Vec<String> = text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect();
    if paragraphs.len() >= 3 {
        return paragraphs;
    }

    let sentences = readability::split_sentences(text);
    if sentences.len() < 4 {
        return vec![text.trim().to_string()];
    }
    sentences.chunks(3).map(|group| group.join(" ")).collect()
}

fn insert_reflection(text: &str) -> String {
    let sections: Vec<&str> = text.split("\n\n---\n\n").collect();
    if sections.len() < 2 {
        return text.to_string();
    }
    let mid = sections.len() / 2;
    let mut parts: Vec<String> = sections[..mid].iter().map(|s| s.to_string()).collect();
    parts.push(REFLECTION_PROMPT.to_string());
    parts.extend(sections[mid..].iter().map(|s| s.to_string()));
    parts.join("\n\n---\n\n")
}

fn match_case(found: &str, replacement: &str) -> String {
    match found.chars().next() {
        Some(c) if c.is_uppercase() => capitalize(replacement),
        _ => replacement.to_string(),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{}...", cut)
}
