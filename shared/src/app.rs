use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capabilities::Capabilities;
use crate::command::Command;
use crate::config::EngineConfig;
use crate::engine::{Engine, EngineEvent};
use crate::notification::Notification;
use crate::projection::{self, ViewModel};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum Event {
    /// Engine config as JSON. Invalid configs are logged and ignored.
    Configure(String),
    Engine(EngineEvent),
    Notification(Notification),
}

impl Event {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Configure(_) => "configure",
            Self::Engine(EngineEvent::RemoteSettled { .. }) => "remote_settled",
            Self::Engine(_) => "engine",
            Self::Notification(n) => n.name(),
        }
    }
}

pub type Model = Engine;

#[derive(Default)]
pub struct App;

impl App {
    fn configure(json: &str, model: &mut Model) -> Vec<Command> {
        let config = match EngineConfig::from_json(json) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "ignoring invalid config");
                return vec![];
            }
        };
        let username = config.username.clone();
        model.reconfigure(EngineConfig {
            username: model.config().username.clone(),
            ..config
        });
        if username == model.config().username {
            return vec![Command::Render];
        }
        model.handle(EngineEvent::SetUser { username })
    }

    /// Hands commands to the capabilities. Replies come back as
    /// `EngineEvent::RemoteSettled` carrying the original tag.
    fn run(commands: Vec<Command>, caps: &Capabilities) {
        let mut render = false;
        for command in commands {
            match command {
                Command::Remote { tag, call } => {
                    debug!(call = call.name(), "remote call");
                    caps.chat_rpc.call(call, move |result| {
                        Event::Engine(EngineEvent::RemoteSettled { tag, result })
                    });
                }
                Command::Schedule { after, event } => {
                    caps.delay.after(after, Event::Engine(event));
                }
                Command::Render => render = true,
                // The engine turns these into its notice before returning.
                Command::Notify(_) | Command::Fail(_) => {
                    debug!("notice command reached the shell boundary");
                    render = true;
                }
            }
        }
        if render {
            caps.render.render();
        }
    }
}

impl crux_core::App for App {
    type Event = Event;
    type Model = Model;
    type ViewModel = ViewModel;
    type Capabilities = Capabilities;

    fn update(&self, event: Event, model: &mut Model, caps: &Capabilities) {
        debug!(event = event.name(), "update");
        let commands = match event {
            Event::Configure(json) => {
                info!("configuring engine");
                Self::configure(&json, model)
            }
            Event::Engine(event) => model.handle(event),
            Event::Notification(notification) => {
                model.handle(EngineEvent::Notification(notification))
            }
        };
        Self::run(commands, caps);
    }

    fn view(&self, model: &Model) -> ViewModel {
        projection::project(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{RemoteCall, RemoteReply};
    use crate::command::ReplyTag;
    use crate::ids::{ConversationIdKey, Username};
    use crate::inbox::RefreshReason;
    use crate::meta::ConversationMeta;
    use crate::Effect;
    use crux_core::testing::AppTester;

    #[test]
    fn configure_sets_user_and_refreshes_inbox() {
        let app = AppTester::<App, Effect>::default();
        let mut model = Model::default();
        let update = app.update(
            Event::Configure(r#"{"username":"me","unbox_batch_size":5}"#.into()),
            &mut model,
        );
        assert_eq!(model.config().username, Some(Username::new("me")));
        assert_eq!(model.config().unbox_batch_size, 5);
        assert!(update.effects.iter().any(|e| matches!(
            e,
            Effect::ChatRpc(request) if request.operation == RemoteCall::GetInboxUntrusted
        )));
    }

    #[test]
    fn invalid_config_is_ignored() {
        let app = AppTester::<App, Effect>::default();
        let mut model = Model::default();
        let update = app.update(Event::Configure(r#"{"unbox_batch_size":0}"#.into()), &mut model);
        assert!(update.effects.is_empty());
        assert_eq!(model.config(), &EngineConfig::default());
    }

    #[test]
    fn remote_reply_re_enters_the_engine() {
        let app = AppTester::<App, Effect>::default();
        let mut model = Model::default();
        app.update(Event::Configure(r#"{"username":"me"}"#.into()), &mut model);
        let reason = RefreshReason::InboxStale;
        let update = app.update(Event::Engine(EngineEvent::RefreshInbox { reason }), &mut model);
        assert!(update.effects.iter().any(|e| matches!(e, Effect::ChatRpc(_))));

        let update = app.update(
            Event::Engine(EngineEvent::RemoteSettled {
                tag: ReplyTag::Inbox { reason },
                result: Ok(RemoteReply::Inbox {
                    conversations: vec![ConversationMeta::new(ConversationIdKey::resolved("c"))],
                }),
            }),
            &mut model,
        );
        assert!(model.metas().contains(&ConversationIdKey::resolved("c")));
        assert!(update.effects.iter().any(|e| matches!(e, Effect::Render(_))));
    }
}
