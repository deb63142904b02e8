//! Classifier behavior over realistic rule documents
//!
//! Exercises the full parse-and-match pipeline through the public API,
//! including the loader path with base64-wrapped documents.

use std::io::Write;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use rust_divert::config::RulesConfig;
use rust_divert::rules::{build_snapshot, Classifier, ClassifierSnapshot, RuleSet};

const SAMPLE_DOCUMENT: &str = r"! sample rule document
[AutoProxy 0.2.9]
||blocked.example
@@||allowed.example
|http://tracker.example
/^ads[0-9]+\./
.suffixed.example
path.example/banner
";

fn classifier_for(tunnel: &str, block: &str) -> Classifier {
    Classifier::new(ClassifierSnapshot {
        tunnel: RuleSet::parse(tunnel),
        user_block: RuleSet::parse(block),
        version: 1,
    })
}

#[test]
fn test_host_rules_use_suffix_semantics() {
    let classifier = classifier_for(SAMPLE_DOCUMENT, "");

    assert!(classifier.is_tunneled("blocked.example"));
    assert!(classifier.is_tunneled("www.blocked.example"));
    assert!(classifier.is_tunneled("deep.cdn.blocked.example"));

    // A label-boundary suffix match, not a substring match: a different
    // registrable domain that merely contains the pattern stays direct.
    assert!(!classifier.is_tunneled("blocked.example.org"));
    assert!(!classifier.is_tunneled("notblocked.example"));
}

#[test]
fn test_whitelist_wins() {
    let doc = "||example\n@@||allowed.example\n";
    let classifier = classifier_for(doc, "");

    assert!(classifier.is_tunneled("www.example"));
    assert!(!classifier.is_tunneled("allowed.example"));
    assert!(!classifier.is_tunneled("www.allowed.example"));
}

#[test]
fn test_regex_rules_match_and_fail_open() {
    let classifier = classifier_for(SAMPLE_DOCUMENT, "");
    assert!(classifier.is_tunneled("ads42.metrics.example"));

    // A malformed pattern never matches and never poisons the rest of the
    // document.
    let broken = "/[unclosed/\n||still.works\n";
    let classifier = classifier_for(broken, "");
    assert!(classifier.is_tunneled("still.works"));
    assert!(!classifier.is_tunneled("unclosed.example"));
}

#[test]
fn test_leading_dot_rules_are_host_rules() {
    let classifier = classifier_for(SAMPLE_DOCUMENT, "");
    assert!(classifier.is_tunneled("suffixed.example"));
    assert!(classifier.is_tunneled("a.suffixed.example"));
}

#[test]
fn test_name_normalization() {
    let classifier = classifier_for("||blocked.example\n", "");

    assert!(classifier.is_tunneled("BLOCKED.Example"));
    assert!(classifier.is_tunneled("blocked.example."));
    assert!(classifier.is_tunneled("www.blocked.example:443"));
}

#[test]
fn test_comments_and_headers_ignored() {
    let doc = "! comment\n[AutoProxy 0.2.9]\n\n||real.example\n";
    let rules = RuleSet::parse(doc);
    assert_eq!(rules.len(), 1);
}

#[test]
fn test_user_block_evaluated_independently() {
    let classifier = classifier_for("||tunneled.example\n", "||banned.example\n");

    assert!(classifier.is_user_blocked("banned.example"));
    assert!(!classifier.is_user_blocked("tunneled.example"));
    assert!(classifier.is_tunneled("tunneled.example"));
    assert!(!classifier.is_tunneled("banned.example"));
}

#[tokio::test]
async fn test_snapshot_from_base64_file() {
    let mut list = tempfile::NamedTempFile::new().unwrap();
    write!(list, "{}", BASE64_STANDARD.encode(SAMPLE_DOCUMENT)).unwrap();

    let mut block = tempfile::NamedTempFile::new().unwrap();
    write!(block, "||banned.example\n").unwrap();

    let config = RulesConfig {
        list_urls: vec![],
        list_files: vec![list.path().to_path_buf()],
        block_files: vec![block.path().to_path_buf()],
    };

    let snapshot = build_snapshot(&config).await.unwrap();
    let classifier = Classifier::new(snapshot);

    assert!(classifier.is_tunneled("www.blocked.example"));
    assert!(!classifier.is_tunneled("allowed.example"));
    assert!(classifier.is_user_blocked("banned.example"));
}

#[test]
fn test_reload_swaps_atomically() {
    let classifier = classifier_for("||old.example\n", "");
    assert!(classifier.is_tunneled("old.example"));
    assert_eq!(classifier.version(), 1);

    classifier.replace(ClassifierSnapshot {
        tunnel: RuleSet::parse("||new.example\n"),
        user_block: RuleSet::parse(""),
        version: 0,
    });

    assert!(!classifier.is_tunneled("old.example"));
    assert!(classifier.is_tunneled("new.example"));
    assert_eq!(classifier.version(), 2);
}
