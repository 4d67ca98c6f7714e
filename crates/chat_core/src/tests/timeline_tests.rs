use super::*;
use chrono::TimeZone;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("timestamp")
}

fn message(key: MessageKey, sender_id: UserId, content: &str, created_at: DateTime<Utc>) -> Message {
    Message {
        key,
        conversation_id: ConversationId(uuid::Uuid::nil()),
        sender_id,
        content: content.into(),
        created_at,
        delivery: DeliveryState::Confirmed,
        attachments: Vec::new(),
        edited: false,
    }
}

fn server(id: &str) -> MessageKey {
    MessageKey::Server(MessageId(id.into()))
}

fn pending(timeline: &mut MessageTimeline, sender: UserId, content: &str, now: DateTime<Utc>) -> TempId {
    let temp_id = TempId::generate();
    let stamp = timeline.local_timestamp(now);
    let mut entry = message(MessageKey::Temp(temp_id), sender, content, stamp);
    entry.delivery = DeliveryState::Pending;
    timeline.insert(entry);
    temp_id
}

fn contents(timeline: &MessageTimeline) -> Vec<String> {
    timeline.messages().map(|m| m.content.clone()).collect()
}

#[test]
fn sorts_by_timestamp_regardless_of_arrival_order() {
    let sender = UserId::new_v4();
    let mut timeline = MessageTimeline::new();
    timeline.insert(message(server("b"), sender, "second", at(2)));
    timeline.insert(message(server("a"), sender, "first", at(1)));
    timeline.insert(message(server("c"), sender, "tie", at(2)));

    assert_eq!(contents(&timeline), vec!["first", "second", "tie"]);
}

#[test]
fn local_timestamps_never_move_backwards() {
    let sender = UserId::new_v4();
    let mut timeline = MessageTimeline::new();
    pending(&mut timeline, sender, "one", at(10));
    pending(&mut timeline, sender, "two", at(5));

    let stamps: Vec<_> = timeline.messages().map(|m| m.created_at).collect();
    assert_eq!(stamps, vec![at(10), at(10)]);
    assert_eq!(contents(&timeline), vec!["one", "two"]);
}

#[test]
fn confirm_rekeys_in_place_and_records_alias() {
    let sender = UserId::new_v4();
    let mut timeline = MessageTimeline::new();
    let temp_id = pending(&mut timeline, sender, "hi", at(0));
    let index = timeline.position(&MessageKey::Temp(temp_id)).expect("pending");

    timeline
        .confirm(index, MessageId("m1".into()), at(0))
        .expect("confirm");

    assert_eq!(timeline.messages().count(), 1);
    assert_eq!(timeline.at(0).key, server("m1"));
    assert_eq!(timeline.at(0).delivery, DeliveryState::Confirmed);
    assert_eq!(timeline.position(&MessageKey::Temp(temp_id)), Some(0));
    assert_eq!(timeline.alias_of(&temp_id), Some(&MessageId("m1".into())));
}

#[test]
fn confirm_with_earlier_authoritative_time_keeps_position() {
    let me = UserId::new_v4();
    let peer = UserId::new_v4();
    let mut timeline = MessageTimeline::new();
    timeline.insert(message(server("p1"), peer, "peer", at(5)));
    let temp_id = pending(&mut timeline, me, "mine", at(6));
    let index = timeline.position(&MessageKey::Temp(temp_id)).expect("pending");

    let index = timeline
        .confirm(index, MessageId("m1".into()), at(4))
        .expect("confirm");

    assert_eq!(index, 1);
    assert_eq!(contents(&timeline), vec!["peer", "mine"]);
    assert_eq!(timeline.at(1).key, server("m1"));
    assert_eq!(timeline.at(1).created_at, at(4));

    timeline.insert(message(server("p2"), peer, "later", at(7)));
    assert_eq!(contents(&timeline), vec!["peer", "mine", "later"]);
}

#[test]
fn secondary_server_id_resolves_to_confirmed_entry() {
    let sender = UserId::new_v4();
    let mut timeline = MessageTimeline::new();
    let temp_id = pending(&mut timeline, sender, "hi", at(0));
    timeline
        .confirm(0, MessageId("ws-1".into()), at(0))
        .expect("confirm");

    assert!(timeline.alias_server(0, MessageId("rest-1".into())));
    assert!(!timeline.alias_server(0, MessageId("rest-1".into())));
    assert!(!timeline.alias_server(0, MessageId("ws-1".into())));

    assert_eq!(timeline.position(&server("rest-1")), Some(0));
    assert_eq!(timeline.position(&server("ws-1")), Some(0));
    assert_eq!(timeline.position(&MessageKey::Temp(temp_id)), Some(0));
    assert_eq!(timeline.at(0).key, server("ws-1"));
}

#[test]
fn pending_entries_take_no_server_alias() {
    let sender = UserId::new_v4();
    let mut timeline = MessageTimeline::new();
    pending(&mut timeline, sender, "hi", at(0));
    assert!(!timeline.alias_server(0, MessageId("rest-1".into())));
    assert_eq!(timeline.position(&server("rest-1")), None);
}

#[test]
fn confirm_of_failed_entry_is_rejected() {
    let sender = UserId::new_v4();
    let mut timeline = MessageTimeline::new();
    let temp_id = pending(&mut timeline, sender, "hi", at(0));
    timeline.mark_failed(0).expect("fail");

    let err = timeline
        .confirm(0, MessageId("m1".into()), at(0))
        .expect_err("failed -> confirmed is illegal");
    assert!(err.is_invariant_violation());
    assert_eq!(timeline.at(0).key, MessageKey::Temp(temp_id));
    assert_eq!(timeline.at(0).delivery, DeliveryState::Failed);
}

#[test]
fn resubmit_moves_failed_entry_behind_newer_pending_entries() {
    let sender = UserId::new_v4();
    let mut timeline = MessageTimeline::new();
    pending(&mut timeline, sender, "first", at(0));
    pending(&mut timeline, sender, "second", at(0));
    timeline.mark_failed(0).expect("fail");

    let fresh = TempId::generate();
    let index = timeline.resubmit(0, fresh, at(0)).expect("resubmit");

    assert_eq!(index, 1);
    assert_eq!(contents(&timeline), vec!["second", "first"]);
    assert_eq!(timeline.at(1).delivery, DeliveryState::Pending);
    assert_eq!(timeline.at(1).key, MessageKey::Temp(fresh));
}

#[test]
fn tombstone_keeps_position_and_redacts() {
    let sender = UserId::new_v4();
    let mut timeline = MessageTimeline::new();
    timeline.insert(message(server("a"), sender, "keep", at(1)));
    timeline.insert(message(server("b"), sender, "gone", at(2)));

    assert!(timeline.tombstone(1).expect("tombstone"));
    assert!(!timeline.tombstone(1).expect("repeat is a no-op"));

    assert_eq!(timeline.messages().count(), 2);
    assert_eq!(timeline.at(1).delivery, DeliveryState::Deleted);
    assert!(timeline.at(1).content.is_empty());
    assert_eq!(timeline.latest_visible().map(|m| m.content.as_str()), Some("keep"));
}

#[test]
fn pending_entries_cannot_be_tombstoned() {
    let sender = UserId::new_v4();
    let mut timeline = MessageTimeline::new();
    pending(&mut timeline, sender, "hi", at(0));
    assert!(timeline.tombstone(0).is_err());
}
