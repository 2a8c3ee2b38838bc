use convo_sync::capabilities::{RemoteCall, RemoteReply};
use convo_sync::command::ReplyTag;
use convo_sync::message::{
    EditTarget, MessageBody, MessageState, Pagination, RemoteMessage, ThreadPage,
};
use convo_sync::meta::ConversationMeta;
use convo_sync::ordinal::Ordinal;
use convo_sync::{
    App, ConversationIdKey, Effect, EngineEvent, Event, MessageId, Model, Notification, OutboxId,
    RemoteError, Username,
};
use crux_core::testing::AppTester;

fn conversation() -> ConversationIdKey {
    ConversationIdKey::resolved("c")
}

/// Signed in with `c` trusted and selected.
fn ready() -> (AppTester<App, Effect>, Model) {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();
    app.update(Event::Configure(r#"{"username":"me"}"#.into()), &mut model);
    app.update(
        Event::Engine(EngineEvent::RemoteSettled {
            tag: ReplyTag::Unbox {
                conversations: vec![conversation()],
            },
            result: Ok(RemoteReply::Unboxed {
                conversations: vec![ConversationMeta {
                    tlf_name: "me,bob".into(),
                    ..ConversationMeta::new(conversation())
                }],
                failures: vec![],
            }),
        }),
        &mut model,
    );
    assert_eq!(model.selected(), &conversation());
    (app, model)
}

fn posted(effects: &[Effect]) -> Vec<(OutboxId, String)> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::ChatRpc(request) => match &request.operation {
                RemoteCall::PostText {
                    outbox_id, text, ..
                } => Some((outbox_id.clone(), text.clone())),
                _ => None,
            },
            _ => None,
        })
        .collect()
}

fn post_reply(outbox_id: OutboxId, result: Result<RemoteReply, RemoteError>) -> Event {
    Event::Engine(EngineEvent::RemoteSettled {
        tag: ReplyTag::Post {
            conversation: conversation(),
            outbox_id,
        },
        result,
    })
}

fn echo(id: u64, outbox_id: &OutboxId, text: &str) -> RemoteMessage {
    RemoteMessage {
        id: MessageId(id),
        outbox_id: Some(outbox_id.clone()),
        author: Username::new("me"),
        timestamp_ms: 0,
        body: MessageBody::text(text),
        exploding_lifetime_secs: None,
        exploded_by: None,
        deleted: false,
        reactions: Default::default(),
    }
}

fn texts(model: &Model) -> Vec<String> {
    model
        .messages()
        .messages(&conversation())
        .filter_map(|m| m.body.as_text().map(str::to_owned))
        .collect()
}

#[test]
fn confirmed_send_keeps_its_ordinal() {
    let (app, mut model) = ready();
    let update = app.update(
        Event::Engine(EngineEvent::SendText { text: "hi".into() }),
        &mut model,
    );
    let (outbox_id, text) = posted(&update.effects).pop().expect("post issued");
    assert_eq!(text, "hi");

    let pending = model.messages().messages(&conversation()).next().cloned().unwrap();
    assert_eq!(pending.state, MessageState::Pending);
    assert!(pending.ordinal > Ordinal::ZERO);
    assert!(pending.ordinal < Ordinal::integral(1));

    app.update(
        post_reply(
            outbox_id,
            Ok(RemoteReply::Posted {
                message_id: MessageId(42),
            }),
        ),
        &mut model,
    );
    let sent = model.messages().messages(&conversation()).next().unwrap();
    assert_eq!(sent.ordinal, pending.ordinal);
    assert_eq!(sent.id, Some(MessageId(42)));
    assert_eq!(sent.state, MessageState::Sent);
}

#[test]
fn sends_keep_submission_order() {
    let (app, mut model) = ready();
    for text in ["one", "two", "three"] {
        app.update(
            Event::Engine(EngineEvent::SendText { text: text.into() }),
            &mut model,
        );
    }
    assert_eq!(texts(&model), vec!["one", "two", "three"]);
}

#[test]
fn transient_failure_stays_pending_and_fatal_failure_can_be_retried() {
    let (app, mut model) = ready();
    let update = app.update(
        Event::Engine(EngineEvent::SendText { text: "hi".into() }),
        &mut model,
    );
    let (outbox_id, _) = posted(&update.effects).pop().unwrap();

    app.update(
        post_reply(outbox_id.clone(), Err(RemoteError::network("offline"))),
        &mut model,
    );
    let message = model.messages().messages(&conversation()).next().unwrap();
    assert_eq!(message.state, MessageState::Pending);
    assert!(app.view(&model).notice.is_none());

    app.update(
        post_reply(outbox_id.clone(), Err(RemoteError::rejected("too long"))),
        &mut model,
    );
    let message = model.messages().messages(&conversation()).next().unwrap();
    assert!(matches!(message.state, MessageState::Failed { .. }));
    let ordinal = message.ordinal;

    let update = app.update(
        Event::Engine(EngineEvent::RetryMessage { ordinal }),
        &mut model,
    );
    let retried = posted(&update.effects);
    assert_eq!(retried, vec![(outbox_id, "hi".to_owned())]);
}

#[test]
fn unchanged_edit_only_clears_the_marker() {
    let (app, mut model) = ready();
    app.update(
        Event::Engine(EngineEvent::SendText { text: "same".into() }),
        &mut model,
    );
    let ordinal = model.messages().messages(&conversation()).next().unwrap().ordinal;
    app.update(
        Event::Engine(EngineEvent::SetEditing {
            ordinal: Some(ordinal),
        }),
        &mut model,
    );
    assert_eq!(model.editing(), Some(ordinal));

    let update = app.update(
        Event::Engine(EngineEvent::EditMessage {
            ordinal,
            text: "same".into(),
        }),
        &mut model,
    );
    assert_eq!(model.editing(), None);
    assert!(!update.effects.iter().any(|e| matches!(e, Effect::ChatRpc(_))));
}

#[test]
fn edit_in_flight_survives_the_late_echo() {
    let (app, mut model) = ready();
    let update = app.update(
        Event::Engine(EngineEvent::SendText { text: "tpyo".into() }),
        &mut model,
    );
    let (outbox_id, _) = posted(&update.effects).pop().unwrap();
    let ordinal = model.messages().messages(&conversation()).next().unwrap().ordinal;

    let update = app.update(
        Event::Engine(EngineEvent::EditMessage {
            ordinal,
            text: "typo".into(),
        }),
        &mut model,
    );
    let target = update
        .effects
        .iter()
        .find_map(|e| match e {
            Effect::ChatRpc(request) => match &request.operation {
                RemoteCall::PostEdit { target, .. } => Some(target.clone()),
                _ => None,
            },
            _ => None,
        })
        .expect("edit goes out");
    assert_eq!(
        target,
        EditTarget {
            message_id: None,
            outbox_id: Some(outbox_id.clone()),
        }
    );

    app.update(
        post_reply(
            outbox_id.clone(),
            Ok(RemoteReply::Posted {
                message_id: MessageId(42),
            }),
        ),
        &mut model,
    );
    app.update(
        Event::Notification(Notification::IncomingMessage {
            conversation: conversation(),
            message: Some(echo(42, &outbox_id, "tpyo")),
            mutation: None,
            meta: None,
        }),
        &mut model,
    );
    assert_eq!(texts(&model), vec!["typo"]);
}

#[test]
fn reload_keeps_confirmed_sends_in_submission_order() {
    let (app, mut model) = ready();
    let load_id = model
        .paginator()
        .state(&conversation())
        .and_then(|s| s.in_flight)
        .expect("selection starts a load");
    let mut outbox_ids = Vec::new();
    for text in ["m1", "m2"] {
        let update = app.update(
            Event::Engine(EngineEvent::SendText { text: text.into() }),
            &mut model,
        );
        outbox_ids.push(posted(&update.effects).pop().unwrap().0);
    }
    app.update(
        post_reply(
            outbox_ids[0].clone(),
            Ok(RemoteReply::Posted {
                message_id: MessageId(42),
            }),
        ),
        &mut model,
    );

    app.update(
        Event::Engine(EngineEvent::RemoteSettled {
            tag: ReplyTag::Thread { load_id },
            result: Ok(RemoteReply::Thread(ThreadPage {
                conversation: conversation(),
                messages: vec![echo(42, &outbox_ids[0], "m1")],
                pagination: Some(Pagination {
                    next: None,
                    last: true,
                }),
            })),
        }),
        &mut model,
    );
    assert_eq!(texts(&model), vec!["m1", "m2"]);
}

#[test]
fn deleting_a_pending_message_cancels_by_outbox() {
    let (app, mut model) = ready();
    app.update(
        Event::Engine(EngineEvent::SendText { text: "oops".into() }),
        &mut model,
    );
    let message = model.messages().messages(&conversation()).next().cloned().unwrap();
    let update = app.update(
        Event::Engine(EngineEvent::DeleteMessage {
            ordinal: message.ordinal,
        }),
        &mut model,
    );
    assert!(update.effects.iter().any(|e| matches!(
        e,
        Effect::ChatRpc(request) if request.operation == RemoteCall::CancelPost {
            conversation: conversation(),
            outbox_id: message.outbox_id.clone().unwrap(),
        }
    )));
}
