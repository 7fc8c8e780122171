//! AMQP topic pattern matching.
//!
//! Routing keys are dot-separated words. In a pattern `*` matches exactly one
//! word and `#` matches zero or more words.

/// Returns true if `routing_key` matches the topic `pattern`.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, remaining)) if word == "*" || word == first => {
                matches_words(rest, remaining)
            },
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_keys_match() {
        assert!(topic_matches("invoice.purchase.created", "invoice.purchase.created"));
        assert!(!topic_matches("invoice.purchase.created", "invoice.purchase.voided"));
    }

    #[test]
    fn star_matches_exactly_one_word() {
        assert!(topic_matches("invoice.*.created", "invoice.purchase.created"));
        assert!(!topic_matches("invoice.*", "invoice.purchase.created"));
        assert!(!topic_matches("invoice.*.created", "invoice.created"));
    }

    #[test]
    fn hash_matches_zero_or_more_words() {
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("invoice.#", "invoice"));
        assert!(topic_matches("invoice.#", "invoice.purchase.created"));
        assert!(topic_matches("#.created", "invoice.purchase.created"));
        assert!(!topic_matches("#.created", "invoice.purchase.voided"));
    }
}
