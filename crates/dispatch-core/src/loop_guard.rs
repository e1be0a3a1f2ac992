// Dispatch core — response-loop detector.
//
// An internal guard the Dispatcher's model loop runs between rounds, not a
// public operation of its own. Three checks, in order, each
// short-circuiting the others: Jaccard word-similarity between the last two
// assistant turns, a consecutive-question check, and a topic-drift check
// against the user's most recent message. Any hit injects one system-role
// redirect message.

use std::collections::HashSet;

use crate::types::{Message, MessageContent, Role};

const REPEAT_SIMILARITY_THRESHOLD: f64 = 0.40;
const SHORT_DIRECTIVE_SIMILARITY_THRESHOLD: f64 = 0.20;
const TOPIC_DRIFT_TOPIC_RATIO_THRESHOLD: f64 = 0.15;
const TOPIC_DRIFT_SIMILARITY_THRESHOLD: f64 = 0.30;
const SHORT_DIRECTIVE_MAX_WORDS: usize = 4;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "could", "should", "may", "might", "can", "shall",
    "to", "of", "in", "for", "on", "with", "at", "by", "from", "as", "into", "about", "like",
    "through", "after", "over", "between", "out", "against", "during", "i", "you", "he", "she",
    "it", "we", "they", "me", "him", "her", "us", "them", "my", "your", "his", "its", "our",
    "their", "this", "that", "these", "those", "and", "but", "or", "nor", "not", "so", "if",
    "then", "than", "too", "very", "just", "don't", "im", "i'd", "i'm", "i'll", "i've",
    "you're", "it's", "what", "how", "all", "each", "which", "who", "when", "where", "why",
];

fn jaccard(a: &str, b: &str) -> f64 {
    let words_a: HashSet<&str> = a.split_whitespace().collect();
    let words_b: HashSet<&str> = b.split_whitespace().collect();
    let union = words_a.union(&words_b).count();
    if union == 0 {
        return 0.0;
    }
    words_a.intersection(&words_b).count() as f64 / union as f64
}

fn keywords(text: &str) -> HashSet<&str> {
    text.split_whitespace().filter(|w| w.len() > 2 && !STOP_WORDS.contains(w)).collect()
}

/// Inspects the last few assistant/user turns and, if a loop pattern is
/// detected, appends a system-role redirect message in place.
pub fn detect_response_loop(messages: &mut Vec<Message>) {
    let assistant_msgs: Vec<String> = messages
        .iter()
        .rev()
        .filter(|m| m.role == Role::Assistant)
        .take(2)
        .map(|m| m.content.as_text().to_lowercase())
        .collect();

    if assistant_msgs.len() < 2 {
        return;
    }

    let a = &assistant_msgs[0];
    let b = &assistant_msgs[1];
    let similarity = jaccard(a, b);

    if similarity > REPEAT_SIMILARITY_THRESHOLD {
        log::warn!("[dispatcher] response loop detected (similarity={:.0}%)", similarity * 100.0);
        inject_loop_break(messages);
        return;
    }

    let a_is_question = a.trim_end().ends_with('?');
    let b_is_question = b.trim_end().ends_with('?');
    if a_is_question && b_is_question {
        log::warn!("[dispatcher] question loop detected — two consecutive clarifying questions");
        inject_loop_break(messages);
        return;
    }

    let Some(user_text) = messages.iter().rev().find(|m| m.role == Role::User).map(|m| m.content.as_text().to_lowercase()) else {
        return;
    };

    let short_directive = user_text.split_whitespace().count() <= SHORT_DIRECTIVE_MAX_WORDS;
    if short_directive && a_is_question && similarity > SHORT_DIRECTIVE_SIMILARITY_THRESHOLD {
        log::warn!("[dispatcher] short-directive loop: user said {user_text:?} but model asked another question");
        inject_loop_break(messages);
        return;
    }

    let user_keywords = keywords(&user_text);
    let asst_keywords = keywords(a);
    if user_keywords.is_empty() || asst_keywords.is_empty() {
        return;
    }
    let topic_ratio = user_keywords.intersection(&asst_keywords).count() as f64 / user_keywords.len() as f64;
    if topic_ratio < TOPIC_DRIFT_TOPIC_RATIO_THRESHOLD && similarity > TOPIC_DRIFT_SIMILARITY_THRESHOLD {
        log::warn!("[dispatcher] topic-ignoring loop: topic_ratio={:.0}% similarity={:.0}%", topic_ratio * 100.0, similarity * 100.0);
        inject_loop_break(messages);
    }
}

fn inject_loop_break(messages: &mut Vec<Message>) {
    let last_user_text = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_text())
        .unwrap_or_default();

    let redirect = if last_user_text.is_empty() {
        "You are stuck in a response loop, repeating the same ground despite the user's request. \
         Read the user's most recent message and respond only to what they actually asked. Do not \
         ask another question; take action with your tools now."
            .to_string()
    } else {
        format!(
            "You are stuck asking clarifying questions instead of acting. The user's actual request \
             is: \"{}\". Take action now — call the relevant tools instead of asking again.",
            crate::util::truncate_utf8(&last_user_text, 300)
        )
    };

    messages.push(Message::system(redirect));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asst(text: &str) -> Message {
        Message::assistant(text)
    }

    #[test]
    fn no_op_with_fewer_than_two_assistant_messages() {
        let mut messages = vec![Message::user("hi"), asst("hello there")];
        let before = messages.len();
        detect_response_loop(&mut messages);
        assert_eq!(messages.len(), before);
    }

    #[test]
    fn detects_repetition_by_jaccard_similarity() {
        let mut messages = vec![
            Message::user("tell me about rust"),
            asst("Rust is a systems programming language focused on safety and speed"),
            Message::user("go on"),
            asst("Rust is a systems programming language focused on speed and safety"),
        ];
        detect_response_loop(&mut messages);
        assert_eq!(messages.last().unwrap().role, Role::System);
    }

    #[test]
    fn detects_consecutive_question_loop() {
        let mut messages = vec![
            Message::user("do both things"),
            asst("Should I start with the first one?"),
            Message::user("yes both"),
            asst("Would you like me to begin with option A?"),
        ];
        detect_response_loop(&mut messages);
        assert_eq!(messages.last().unwrap().role, Role::System);
    }

    #[test]
    fn leaves_healthy_conversation_untouched() {
        let mut messages = vec![
            Message::user("what's the weather"),
            asst("It's sunny and 72 degrees today."),
            Message::user("what about tomorrow"),
            asst("Tomorrow looks cloudy with a chance of rain in the evening."),
        ];
        let before = messages.len();
        detect_response_loop(&mut messages);
        assert_eq!(messages.len(), before);
    }
}
