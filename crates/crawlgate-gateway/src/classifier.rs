//! User-Agent based traffic classification.
//!
//! A request is treated as automated when its User-Agent contains one of a
//! small set of known AI crawler / agent identifiers. Matching is a
//! case-insensitive substring test. A missing or empty User-Agent carries no
//! signal of automation and is classified as human.

/// Known AI crawler and agent identifiers.
pub const DEFAULT_BOT_PATTERNS: &[&str] = &[
    "GPTBot",
    "ChatGPT-User",
    "OAI-SearchBot",
    "ClaudeBot",
    "Claude-Web",
    "Claude-User",
    "anthropic-ai",
    "CCBot",
    "PerplexityBot",
    "Perplexity-User",
    "Google-Extended",
    "Bytespider",
    "Amazonbot",
    "Applebot-Extended",
    "cohere-ai",
    "Diffbot",
    "FacebookBot",
    "Meta-ExternalAgent",
    "YouBot",
    "ImagesiftBot",
    "Omgilibot",
    "Timpibot",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Human,
    Bot,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Human => "human",
            Classification::Bot => "bot",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrafficClassifier {
    /// Lower-cased patterns
    patterns: Vec<String>,
}

impl Default for TrafficClassifier {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl TrafficClassifier {
    /// Build a classifier from the built-in list plus operator supplied extras.
    pub fn new(extra_patterns: &[String]) -> Self {
        let mut patterns: Vec<String> = DEFAULT_BOT_PATTERNS
            .iter()
            .map(|p| p.to_ascii_lowercase())
            .collect();

        for extra in extra_patterns {
            let extra = extra.trim().to_ascii_lowercase();
            if !extra.is_empty() && !patterns.contains(&extra) {
                patterns.push(extra);
            }
        }

        Self { patterns }
    }

    pub fn classify(&self, user_agent: Option<&str>) -> Classification {
        let ua = match user_agent.map(str::trim) {
            Some(ua) if !ua.is_empty() => ua.to_ascii_lowercase(),
            _ => return Classification::Human,
        };

        if self.patterns.iter().any(|p| ua.contains(p.as_str())) {
            Classification::Bot
        } else {
            Classification::Human
        }
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_default_pattern_is_a_bot() {
        let classifier = TrafficClassifier::default();
        for pattern in DEFAULT_BOT_PATTERNS {
            let ua = format!("Mozilla/5.0 (compatible; {}/1.0; +https://example.com/bot)", pattern);
            assert_eq!(classifier.classify(Some(&ua)), Classification::Bot, "{ua}");
        }
    }

    #[test]
    fn test_matching_ignores_case() {
        let classifier = TrafficClassifier::default();
        assert_eq!(classifier.classify(Some("gptbot")), Classification::Bot);
        assert_eq!(classifier.classify(Some("CLAUDEBOT/1.0")), Classification::Bot);
        assert_eq!(classifier.classify(Some("Anthropic-AI")), Classification::Bot);
    }

    #[test]
    fn test_browsers_are_human() {
        let classifier = TrafficClassifier::default();
        let chrome = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                      (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
        assert_eq!(classifier.classify(Some(chrome)), Classification::Human);
        assert_eq!(classifier.classify(Some("curl/8.4.0")), Classification::Human);
    }

    #[test]
    fn test_missing_or_blank_user_agent_is_human() {
        let classifier = TrafficClassifier::default();
        assert_eq!(classifier.classify(None), Classification::Human);
        assert_eq!(classifier.classify(Some("")), Classification::Human);
        assert_eq!(classifier.classify(Some("   ")), Classification::Human);
    }

    #[test]
    fn test_extra_patterns_extend_defaults() {
        let classifier = TrafficClassifier::new(&["ExampleScraper".to_string(), " ".to_string()]);
        assert_eq!(
            classifier.classify(Some("examplescraper/2.1")),
            Classification::Bot
        );
        assert_eq!(classifier.classify(Some("GPTBot")), Classification::Bot);
        assert_eq!(classifier.pattern_count(), DEFAULT_BOT_PATTERNS.len() + 1);
    }

    #[test]
    fn test_duplicate_extra_pattern_is_ignored() {
        let classifier = TrafficClassifier::new(&["gptbot".to_string()]);
        assert_eq!(classifier.pattern_count(), DEFAULT_BOT_PATTERNS.len());
    }
}
