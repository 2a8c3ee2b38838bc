mod chat_rpc;
mod delay;

pub use self::chat_rpc::{ChatRpc, RemoteCall, RemoteReply, RemoteResult, UnboxFailure};
pub use self::delay::{Delay, DelayOperation};

// Crux's built-in Render is all the shell needs to know the projection
// changed.
pub use crux_core::render::Render;

use crate::app::{App, Event};

pub type AppChatRpc = ChatRpc<Event>;
pub type AppDelay = Delay<Event>;
pub type AppRender = Render<Event>;

#[derive(crux_core::macros::Effect)]
pub struct Capabilities {
    pub chat_rpc: ChatRpc<Event>,
    pub delay: Delay<Event>,
    pub render: Render<Event>,
}
