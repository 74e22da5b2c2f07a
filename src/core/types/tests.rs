//! Tests for core data types

use super::*;
use proptest::prelude::*;

#[test]
fn test_builtin_labels_parse_case_insensitively() {
    assert_eq!("Confidential".parse::<Label>().unwrap(), Label::Confidential);
    assert_eq!("  SECRET ".parse::<Label>().unwrap(), Label::Secret);
    assert_eq!("internal".parse::<Label>().unwrap(), Label::Internal);
    assert_eq!("restricted\n".parse::<Label>().unwrap(), Label::Restricted);
}

#[test]
fn test_custom_label() {
    let label: Label = "Legal-Hold".parse().unwrap();
    assert_eq!(label, Label::Custom("legal-hold".to_string()));
    assert!(!label.is_builtin());
    assert_eq!(label.to_string(), "legal-hold");
}

#[test]
fn test_empty_label_rejected() {
    assert!("".parse::<Label>().is_err());
    assert!("   ".parse::<Label>().is_err());
}

#[test]
fn test_label_serde_is_plain_string() {
    let json = serde_json::to_string(&Label::Secret).unwrap();
    assert_eq!(json, "\"secret\"");
    let back: Label = serde_json::from_str("\"Internal\"").unwrap();
    assert_eq!(back, Label::Internal);
}

#[test]
fn test_event_type_wire_names() {
    assert_eq!(EventType::FileCreated.as_str(), "FILE_CREATED");
    assert_eq!(
        serde_json::to_string(&EventType::FileRenamed).unwrap(),
        "\"FILE_RENAMED\""
    );
    assert_eq!("FILE_DELETED".parse::<EventType>().unwrap(), EventType::FileDeleted);
    assert_eq!("RENAMED_OLD".parse::<EventType>().unwrap(), EventType::Unknown);
}

#[test]
fn test_event_json_uses_store_field_names() {
    let event = NewEvent::new(EventType::FileCreated, "/data/report.xlsx")
        .with_label(Some(Label::Confidential))
        .with_hash(Some(ContentHash::from_hex("ABCDEF")))
        .with_actor("alice")
        .into_event(7);

    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["id"], 7);
    assert_eq!(value["event_type"], "FILE_CREATED");
    assert_eq!(value["label"], "confidential");
    assert_eq!(value["sha256"], "abcdef");
    assert_eq!(value["user"], "alice");
    assert!(value["new_path"].is_null());
}

#[test]
fn test_new_event_defaults_to_unknown_actor() {
    let event = NewEvent::new(EventType::FileModified, "/x");
    assert_eq!(event.actor_identity, UNKNOWN_ACTOR);
    assert!(event.content_hash.is_none());
}

proptest! {
    #[test]
    fn prop_label_display_roundtrips(name in "[a-zA-Z][a-zA-Z0-9_-]{0,20}") {
        let label: Label = name.parse().unwrap();
        let reparsed: Label = label.to_string().parse().unwrap();
        prop_assert_eq!(label, reparsed);
    }
}
