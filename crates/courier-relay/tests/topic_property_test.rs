//! Property-based tests for topic pattern matching.

use courier_relay::topic_matches;
use proptest::{prelude::*, test_runner::Config as ProptestConfig};

fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 128,
        fork: false,
        failure_persistence: None,
        source_file: None,
        ..ProptestConfig::default()
    }
}

fn words_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-z]{1,8}", 1..6)
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn key_matches_itself(words in words_strategy()) {
        let key = words.join(".");
        prop_assert!(topic_matches(&key, &key));
    }

    #[test]
    fn hash_alone_matches_everything(words in words_strategy()) {
        prop_assert!(topic_matches("#", &words.join(".")));
    }

    #[test]
    fn star_stands_for_any_single_word(
        words in words_strategy(),
        index in any::<prop::sample::Index>(),
    ) {
        let mut pattern = words.clone();
        pattern[index.index(words.len())] = "*".to_string();
        prop_assert!(topic_matches(&pattern.join("."), &words.join(".")));
    }

    #[test]
    fn extra_words_need_a_wildcard(words in words_strategy(), extra in "[a-z]{1,8}") {
        let pattern = words.join(".");
        let key = format!("{pattern}.{extra}");
        prop_assert!(!topic_matches(&pattern, &key));
        let hash_pattern = format!("{pattern}.#");
        let star_pattern = format!("{pattern}.*");
        prop_assert!(topic_matches(&hash_pattern, &key));
        prop_assert!(topic_matches(&star_pattern, &key));
    }
}
