//! Heuristic detection of programs blocked on stdin.
//!
//! This is best-effort. A slow program that printed a line containing `:`
//! is reported as waiting (false positive), and a program that reads input
//! without printing any prompt after a complete line is missed (false
//! negative). When a program answers on the prompt's own line, as in
//! `Name: hi Ada`, the `:` of the old prompt still matches; the output
//! buffer avoids that by only classifying output produced after the last
//! delivered input. The marker and keyword lists are tunable; callers
//! confirm a detection by checking the program is still running and silent.

use crate::language::Language;

/// Words that usually mean a prompt, in English and Vietnamese.
const PROMPT_KEYWORDS: [&str; 8] = [
    "enter", "input", "type", "please", "nhập", "nhap", "vui lòng", "mời",
];

const PROMPT_PUNCTUATION: [char; 2] = [':', '?'];

/// Result of running the detector over an output tail.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Detection {
    pub waiting: bool,
    pub prompt: Option<String>,
}

impl Detection {
    fn waiting(prompt: Option<&str>) -> Self {
        Self {
            waiting: true,
            prompt: prompt.map(ToString::to_string),
        }
    }
}

/// Text that shows up in output when the scripting runtimes hit an
/// interactive read primitive.
const fn read_markers(language: Language) -> &'static [&'static str] {
    match language {
        Language::Javascript => &["prompt(", "readline", "question("],
        Language::Python => &["input("],
        _ => &[],
    }
}

/// Classify `tail` (the most recent output) as waiting for input or not.
///
/// Rules, first match wins:
/// 1. a language read marker appears anywhere in the tail;
/// 2. the last non-empty line contains prompt punctuation or a prompt keyword;
/// 3. the tail ends in a partial line (no trailing newline).
pub fn detect(tail: &str, language: Language) -> Detection {
    let last_line = tail
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty());
    let Some(last_line) = last_line else {
        return Detection::default();
    };

    if read_markers(language).iter().any(|m| tail.contains(m)) {
        return Detection::waiting(Some(last_line));
    }

    let lowered = last_line.to_lowercase();
    if last_line.contains(PROMPT_PUNCTUATION)
        || PROMPT_KEYWORDS.iter().any(|k| lowered.contains(k))
    {
        return Detection::waiting(Some(last_line));
    }

    if !tail.trim_end_matches('\r').ends_with('\n') {
        return Detection::waiting(Some(last_line));
    }

    Detection::default()
}
