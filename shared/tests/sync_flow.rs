use convo_sync::capabilities::{RemoteCall, RemoteReply};
use convo_sync::command::ReplyTag;
use convo_sync::inbox::RefreshReason;
use convo_sync::meta::{ConversationMeta, TrustedState};
use convo_sync::pending::PendingMode;
use convo_sync::{App, ConversationIdKey, Effect, EngineEvent, Event, Model, Username};
use crux_core::testing::AppTester;
use std::collections::BTreeSet;

fn signed_in(app: &AppTester<App, Effect>) -> Model {
    let mut model = Model::default();
    app.update(Event::Configure(r#"{"username":"me"}"#.into()), &mut model);
    model
}

fn meta(id: &str, ts: u64) -> ConversationMeta {
    ConversationMeta {
        last_activity_ms: ts,
        tlf_name: format!("me,{id}"),
        ..ConversationMeta::new(ConversationIdKey::resolved(id))
    }
}

fn settle(tag: ReplyTag, result: Result<RemoteReply, convo_sync::RemoteError>) -> Event {
    Event::Engine(EngineEvent::RemoteSettled { tag, result })
}

fn trusted_batches(effects: &[Effect]) -> Vec<Vec<ConversationIdKey>> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::ChatRpc(request) => match &request.operation {
                RemoteCall::GetInboxTrusted { conversations, .. } => Some(conversations.clone()),
                _ => None,
            },
            _ => None,
        })
        .collect()
}

fn delays(effects: &[Effect]) -> Vec<u64> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::Delay(request) => Some(request.operation.millis),
            _ => None,
        })
        .collect()
}

#[test]
fn twelve_untrusted_conversations_drain_in_two_batches() {
    let app = AppTester::<App, Effect>::default();
    let mut model = signed_in(&app);

    let metas: Vec<ConversationMeta> = (0..12).map(|i| meta(&format!("c{i:02}"), i)).collect();
    let update = app.update(
        settle(
            ReplyTag::Inbox {
                reason: RefreshReason::Bootstrapping,
            },
            Ok(RemoteReply::Inbox {
                conversations: metas,
            }),
        ),
        &mut model,
    );

    let first = trusted_batches(&update.effects);
    assert_eq!(first.len(), 1);
    let expected: Vec<ConversationIdKey> = (2..12)
        .map(|i| ConversationIdKey::resolved(format!("c{i:02}")))
        .collect();
    assert_eq!(first[0], expected);
    assert_eq!(delays(&update.effects), vec![100]);

    let update = app.update(Event::Engine(EngineEvent::DrainUnboxQueue), &mut model);
    let second = trusted_batches(&update.effects);
    assert_eq!(
        second,
        vec![vec![
            ConversationIdKey::resolved("c00"),
            ConversationIdKey::resolved("c01")
        ]]
    );
    assert!(delays(&update.effects).is_empty());
    assert!(model.unbox_queue().is_empty());
}

#[test]
fn requeueing_known_conversations_is_silent() {
    let app = AppTester::<App, Effect>::default();
    let mut model = signed_in(&app);
    app.update(
        settle(
            ReplyTag::Inbox {
                reason: RefreshReason::Bootstrapping,
            },
            Ok(RemoteReply::Inbox {
                conversations: vec![meta("a", 1)],
            }),
        ),
        &mut model,
    );

    let update = app.update(
        Event::Engine(EngineEvent::QueueMetas {
            conversations: vec![ConversationIdKey::resolved("a")],
        }),
        &mut model,
    );
    assert!(update.effects.is_empty());
}

#[test]
fn trusted_reply_upgrades_meta() {
    let app = AppTester::<App, Effect>::default();
    let mut model = signed_in(&app);
    let id = ConversationIdKey::resolved("a");
    app.update(
        Event::Engine(EngineEvent::QueueMetas {
            conversations: vec![id.clone()],
        }),
        &mut model,
    );
    app.update(
        settle(
            ReplyTag::Unbox {
                conversations: vec![id.clone()],
            },
            Ok(RemoteReply::Unboxed {
                conversations: vec![meta("a", 3)],
                failures: vec![],
            }),
        ),
        &mut model,
    );
    assert_eq!(model.metas().trusted_state(&id), TrustedState::Trusted);
    assert_eq!(model.selected(), &id);
}

#[test]
fn leaving_the_only_conversation_clears_selection() {
    let app = AppTester::<App, Effect>::default();
    let mut model = signed_in(&app);
    let id = ConversationIdKey::resolved("c");
    app.update(
        settle(
            ReplyTag::Unbox {
                conversations: vec![id.clone()],
            },
            Ok(RemoteReply::Unboxed {
                conversations: vec![meta("c", 1)],
                failures: vec![],
            }),
        ),
        &mut model,
    );
    assert_eq!(model.selected(), &id);

    let update = app.update(
        Event::Engine(EngineEvent::LeaveConversation {
            conversation: id.clone(),
        }),
        &mut model,
    );
    assert!(update.effects.iter().any(|e| matches!(
        e,
        Effect::ChatRpc(request) if matches!(request.operation, RemoteCall::LeaveConversation { .. })
    )));

    app.update(
        settle(
            ReplyTag::Leave {
                conversation: id,
                avoid_team: None,
            },
            Ok(RemoteReply::Ack),
        ),
        &mut model,
    );
    assert_eq!(model.selected(), &ConversationIdKey::NoConversation);
    assert!(app.view(&model).conversations.is_empty());
}

#[test]
fn stale_find_existing_reply_is_discarded() {
    let app = AppTester::<App, Effect>::default();
    let mut model = signed_in(&app);
    let ab: BTreeSet<Username> = [Username::new("a"), Username::new("b")].into_iter().collect();
    let ac: BTreeSet<Username> = [Username::new("a"), Username::new("c")].into_iter().collect();

    app.update(
        Event::Engine(EngineEvent::ComposeWithUsers {
            users: ab.clone(),
            from_reset: false,
        }),
        &mut model,
    );
    app.update(
        Event::Engine(EngineEvent::ComposeWithUsers {
            users: ac.clone(),
            from_reset: false,
        }),
        &mut model,
    );
    let before = model.pending().state().clone();

    app.update(
        settle(
            ReplyTag::FindExisting { participants: ab },
            Ok(RemoteReply::Found {
                conversations: vec![meta("ab", 1)],
            }),
        ),
        &mut model,
    );
    assert_eq!(model.pending().state(), &before);
    assert_eq!(model.pending().state().mode, PendingMode::FixedSetOfUsers);
    assert_eq!(model.pending().state().candidate_users, ac);
    assert_eq!(
        model.pending().resolved(),
        Some(&ConversationIdKey::PendingWaiting)
    );
}

#[test]
fn scrollback_with_nothing_more_makes_no_request() {
    let app = AppTester::<App, Effect>::default();
    let mut model = signed_in(&app);
    let id = ConversationIdKey::resolved("c");
    app.update(
        settle(
            ReplyTag::Unbox {
                conversations: vec![id.clone()],
            },
            Ok(RemoteReply::Unboxed {
                conversations: vec![meta("c", 1)],
                failures: vec![],
            }),
        ),
        &mut model,
    );
    let load_id = model
        .paginator()
        .state(&id)
        .and_then(|s| s.in_flight)
        .expect("selection starts a load");
    app.update(
        settle(
            ReplyTag::Thread { load_id },
            Ok(RemoteReply::Thread(convo_sync::message::ThreadPage {
                conversation: id.clone(),
                messages: vec![],
                pagination: Some(convo_sync::message::Pagination {
                    next: None,
                    last: true,
                }),
            })),
        ),
        &mut model,
    );
    assert!(!model.paginator().more_to_load(&id));

    let update = app.update(Event::Engine(EngineEvent::LoadOlderMessages), &mut model);
    assert!(!update
        .effects
        .iter()
        .any(|e| matches!(e, Effect::ChatRpc(_))));
}
