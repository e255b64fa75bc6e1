//! Completion protocol for evaluator responses.
//!
//! The evaluator is asked to answer with exactly one sentinel token. Oracle
//! output is free text, so the matching rule is a configurable policy.

use serde::{Deserialize, Serialize};

/// Sentinel meaning the mission is complete.
pub const COMPLETION_TOKEN: &str = "ENDOFMISSION";
/// Sentinel meaning more work is needed.
pub const CONTINUE_TOKEN: &str = "NOTSOLVED";

/// How an evaluator response is matched against [`COMPLETION_TOKEN`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionMatch {
    /// Keep only `A-Z`, then look for the token anywhere.
    ///
    /// A response that merely quotes the token also counts as completion.
    #[default]
    Loose,
    /// The response, minus surrounding whitespace, fences, quotes, braces,
    /// emphasis markers and periods, must be exactly the token.
    Strict,
}

/// Decide whether an evaluator response declares the mission complete.
pub fn signals_completion(response: &str, mode: CompletionMatch) -> bool {
    match mode {
        CompletionMatch::Loose => {
            let letters: String = response.chars().filter(char::is_ascii_uppercase).collect();
            letters.contains(COMPLETION_TOKEN)
        }
        CompletionMatch::Strict => unwrap_answer(response) == COMPLETION_TOKEN,
    }
}

fn unwrap_answer(response: &str) -> &str {
    let mut answer = response.trim();
    loop {
        let next = answer.trim_matches(|c: char| {
            c.is_whitespace() || matches!(c, '`' | '"' | '\'' | '{' | '}' | '*' | '.')
        });
        if next == answer {
            return answer;
        }
        answer = next;
    }
}
