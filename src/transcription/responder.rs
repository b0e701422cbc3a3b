//! # Responder Policy
//!
//! Turns a transcript into the assistant's reply. Policies are pure and total:
//! every input, including the empty transcript, produces a reply.

use chrono::Local;

pub trait ResponderPolicy: Send + Sync {
    fn reply(&self, text: &str) -> String;
}

/// Keyword rules with an echo fallback.
///
/// ## Rules (first match wins):
/// - empty input → ask the user to repeat
/// - mentions the time → current local time (`HH:MM`)
/// - mentions the weather → explain no weather source is configured
/// - asks who the assistant is → short self description
/// - anything else → echo back what was heard
#[derive(Debug, Clone, Default)]
pub struct RuleResponder;

impl RuleResponder {
    pub const FALLBACK: &'static str = "I didn't catch that, could you say it again?";
}

impl ResponderPolicy for RuleResponder {
    fn reply(&self, text: &str) -> String {
        let text = text.trim();
        if text.is_empty() {
            return Self::FALLBACK.to_string();
        }

        let lower = text.to_lowercase();
        if lower.contains("time") || text.contains("几点") {
            return format!("It is {} right now.", Local::now().format("%H:%M"));
        }
        if lower.contains("weather") || text.contains("天气") {
            return "I don't have a weather source connected yet, but I've noted the question."
                .to_string();
        }
        if lower.contains("who are you") || text.contains("你是谁") {
            return "I'm the voice assistant listening on this device.".to_string();
        }

        format!("Got it: {text}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_gets_fallback() {
        let responder = RuleResponder;
        assert_eq!(responder.reply(""), RuleResponder::FALLBACK);
        assert_eq!(responder.reply("   "), RuleResponder::FALLBACK);
    }

    #[test]
    fn test_keyword_rules() {
        let responder = RuleResponder;
        assert!(responder.reply("What time is it?").starts_with("It is "));
        assert!(responder.reply("现在几点").starts_with("It is "));
        assert!(responder.reply("how is the Weather").contains("weather source"));
        assert!(responder.reply("Who are you").contains("voice assistant"));
    }

    #[test]
    fn test_echo_fallback() {
        let responder = RuleResponder;
        assert_eq!(responder.reply(" turn on the lights "), "Got it: turn on the lights");
    }
}
