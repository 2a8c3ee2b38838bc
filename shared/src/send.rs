//! Optimistic send/edit/delete pipeline and its reconciliation with the
//! service.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

use crate::capabilities::{RemoteCall, RemoteReply, RemoteResult};
use crate::command::{Command, ReplyTag};
use crate::error::{EngineError, Notice, RemoteError};
use crate::ids::{ConversationIdKey, MessageId, OutboxId, Username};
use crate::message::{EditTarget, MessageBody, MessageState, MessageStore, PendingMessage};
use crate::meta::MetaStore;
use crate::ordinal::Ordinal;
use crate::outbox::{Outbox, OutboxEntry, OutboxIntent};

/// Ratio shown as soon as the shell reports an upload has started.
pub const UPLOAD_STARTED_RATIO: f32 = 0.01;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AttachmentSpec {
    pub file_path: String,
    pub title: String,
}

impl AttachmentSpec {
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.file_path
            .rsplit(|c| c == '/' || c == '\\')
            .next()
            .unwrap_or(&self.file_path)
    }
}

/// The stores a send operation reads and writes.
pub struct SendContext<'a> {
    pub messages: &'a mut MessageStore,
    pub metas: &'a MetaStore,
    pub you: &'a Username,
}

impl SendContext<'_> {
    fn tlf_name(&self, conversation: &ConversationIdKey) -> Option<String> {
        self.metas.get(conversation).map(|m| m.tlf_name.clone())
    }
}

#[derive(Debug)]
struct UploadBatch {
    conversation: ConversationIdKey,
    tlf_name: String,
    files: Vec<AttachmentSpec>,
    outbox_ids: Vec<OutboxId>,
    previews: Vec<Option<String>>,
    uploading: usize,
    exploding_lifetime_secs: Option<u64>,
}

#[derive(Debug)]
pub struct SendPipeline {
    outbox: Outbox,
    uploads: HashMap<u64, UploadBatch>,
    next_batch: u64,
    held_sends: Vec<OutboxId>,
    held_uploads: Vec<Vec<AttachmentSpec>>,
    confirm_slot: Option<(ConversationIdKey, OutboxId)>,
    exploding_modes: HashMap<ConversationIdKey, u64>,
    progress_step: f32,
}

impl Default for SendPipeline {
    fn default() -> Self {
        Self::new(
            crate::config::DEFAULT_RESOLVED_OUTBOX_MEMORY,
            crate::config::DEFAULT_UPLOAD_PROGRESS_STEP,
        )
    }
}

impl SendPipeline {
    #[must_use]
    pub fn new(resolved_memory: usize, progress_step: f32) -> Self {
        Self {
            outbox: Outbox::new(resolved_memory),
            uploads: HashMap::new(),
            next_batch: 1,
            held_sends: Vec::new(),
            held_uploads: Vec::new(),
            confirm_slot: None,
            exploding_modes: HashMap::new(),
            progress_step,
        }
    }

    pub fn set_progress_step(&mut self, step: f32) {
        self.progress_step = step;
    }

    pub fn set_resolved_memory(&mut self, resolved_memory: usize) {
        self.outbox.set_resolved_memory(resolved_memory);
    }

    #[must_use]
    pub const fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    #[must_use]
    pub fn has_held(&self) -> bool {
        !self.held_sends.is_empty() || !self.held_uploads.is_empty()
    }

    #[must_use]
    pub fn confirm_pending(&self) -> Option<&OutboxId> {
        self.confirm_slot.as_ref().map(|(_, id)| id)
    }

    #[must_use]
    pub fn exploding_mode(&self, conversation: &ConversationIdKey) -> Option<u64> {
        self.exploding_modes.get(conversation).copied()
    }

    /// Zero turns exploding mode off.
    pub fn set_exploding_mode(&mut self, conversation: &ConversationIdKey, seconds: u64) {
        if seconds == 0 {
            self.exploding_modes.remove(conversation);
        } else {
            self.exploding_modes.insert(conversation.clone(), seconds);
        }
    }

    /// Inserts the pending message, then posts it.
    ///
    /// A pending-conversation identity holds the message locally until the
    /// conversation resolves; see [`Self::flush_held`].
    pub fn send_text(&mut self, ctx: &mut SendContext<'_>, conversation: &ConversationIdKey, text: &str) -> Vec<Command> {
        let held = conversation.is_pending();
        let tlf_name = if held {
            None
        } else {
            match ctx.tlf_name(conversation) {
                Some(tlf) if conversation.is_valid() => Some(tlf),
                _ => {
                    warn!(conversation = %conversation, "dropping send to unknown conversation");
                    return vec![];
                }
            }
        };
        let local = if held {
            ConversationIdKey::Pending
        } else {
            conversation.clone()
        };

        let outbox_id = OutboxId::generate();
        let exploding_lifetime_secs = self.exploding_mode(&local);
        let ordinal = ctx.messages.insert_pending(
            &local,
            PendingMessage {
                outbox_id: outbox_id.clone(),
                author: ctx.you.clone(),
                timestamp_ms: now_ms(),
                body: MessageBody::text(text),
                exploding_lifetime_secs,
            },
        );
        if let Err(e) = self.outbox.track(OutboxEntry::new(
            outbox_id.clone(),
            OutboxIntent::Send { text: text.to_owned() },
            local.clone(),
        )) {
            error!(error = %e, "outbox id collision");
            return vec![Command::Render];
        }

        let Some(tlf_name) = tlf_name else {
            debug!(%outbox_id, %ordinal, "holding send until conversation resolves");
            self.held_sends.push(outbox_id);
            return vec![Command::Render];
        };
        info!(conversation = %local, %outbox_id, %ordinal, "posting message");
        vec![
            Command::Render,
            self.post_text(&local, tlf_name, outbox_id, text.to_owned(), exploding_lifetime_secs),
        ]
    }

    fn post_text(
        &mut self,
        conversation: &ConversationIdKey,
        tlf_name: String,
        outbox_id: OutboxId,
        text: String,
        exploding_lifetime_secs: Option<u64>,
    ) -> Command {
        self.count_attempt(&outbox_id);
        Command::remote(
            ReplyTag::Post {
                conversation: conversation.clone(),
                outbox_id: outbox_id.clone(),
            },
            RemoteCall::PostText {
                conversation: conversation.clone(),
                tlf_name,
                outbox_id,
                text,
                exploding_lifetime_secs,
            },
        )
    }

    /// Counts a request against its outbox entry. The request still goes out
    /// when the entry is gone; the miss is only logged.
    fn count_attempt(&mut self, outbox_id: &OutboxId) -> Option<u32> {
        match self.outbox.record_attempt(outbox_id) {
            Ok(attempts) => Some(attempts),
            Err(e) => {
                warn!(error = %e, "attempt for untracked outbox entry");
                None
            }
        }
    }

    /// The service saw the outbox record. The message was inserted before
    /// the request went out, so there is nothing left to do.
    pub fn ready_to_send(&self, conversation: &ConversationIdKey, outbox_id: &OutboxId) {
        debug!(conversation = %conversation, %outbox_id, "ready to send");
    }

    /// An echo of our own message arrived; the intent is done. Returns the
    /// text the send was edited to in flight, which the echo may predate.
    pub fn acknowledge(&mut self, outbox_id: &OutboxId) -> Option<String> {
        if self.outbox.resolve(outbox_id).is_some() {
            debug!(%outbox_id, "outbox entry acknowledged");
        } else if !self.outbox.was_resolved(outbox_id) {
            return None;
        }
        self.outbox.take_edited_text(outbox_id)
    }

    pub fn on_post_reply(
        &mut self,
        ctx: &mut SendContext<'_>,
        conversation: &ConversationIdKey,
        outbox_id: &OutboxId,
        result: RemoteResult,
    ) -> Vec<Command> {
        match result {
            Ok(RemoteReply::Posted { message_id }) => {
                ctx.messages.mark_sent(conversation, outbox_id, message_id);
                self.outbox.resolve(outbox_id);
                info!(conversation = %conversation, %outbox_id, %message_id, "message sent");
                vec![Command::Render]
            }
            Ok(other) => {
                error!(?other, %outbox_id, "post reply carried no message id");
                vec![Command::Fail(EngineError::MissingRemoteData { what: "message id" })]
            }
            Err(e) => self.post_failed(ctx, conversation, outbox_id, &e),
        }
    }

    fn post_failed(
        &mut self,
        ctx: &mut SendContext<'_>,
        conversation: &ConversationIdKey,
        outbox_id: &OutboxId,
        e: &RemoteError,
    ) -> Vec<Command> {
        if e.is_transient() {
            warn!(conversation = %conversation, %outbox_id, error = %e, "transient send failure");
            return vec![];
        }
        error!(conversation = %conversation, %outbox_id, error = %e, "send failed");
        ctx.messages
            .mark_failed(conversation, outbox_id, e.user_facing_message());
        vec![Command::Render]
    }

    /// Failure reported asynchronously by the service for an outbox record.
    pub fn message_failed(
        &mut self,
        ctx: &mut SendContext<'_>,
        conversation: &ConversationIdKey,
        outbox_id: &OutboxId,
        reason: &str,
    ) -> bool {
        ctx.messages.mark_failed(conversation, outbox_id, reason)
    }

    /// Re-issues a failed send with its original outbox id.
    pub fn retry(&mut self, ctx: &mut SendContext<'_>, conversation: &ConversationIdKey, ordinal: Ordinal) -> Vec<Command> {
        let Some(message) = ctx.messages.get(conversation, ordinal) else {
            warn!(conversation = %conversation, %ordinal, "retry for unknown message");
            return vec![];
        };
        let (MessageState::Failed { .. }, Some(outbox_id)) = (&message.state, message.outbox_id.clone()) else {
            warn!(conversation = %conversation, %ordinal, "retry for message that has not failed");
            return vec![];
        };
        let Some(tlf_name) = ctx.tlf_name(conversation) else {
            warn!(conversation = %conversation, "retry in unknown conversation");
            return vec![];
        };
        let exploding = message.exploding_lifetime_secs;
        ctx.messages.mark_retrying(conversation, &outbox_id);

        let text = match self.outbox.get(&outbox_id).map(|e| &e.intent) {
            Some(OutboxIntent::Send { text }) => Some(text.clone()),
            _ => None,
        };
        info!(conversation = %conversation, %outbox_id, "retrying send");
        let call = match text {
            Some(text) => self.post_text(conversation, tlf_name, outbox_id, text, exploding),
            None => {
                self.count_attempt(&outbox_id);
                Command::remote(
                    ReplyTag::Post {
                        conversation: conversation.clone(),
                        outbox_id: outbox_id.clone(),
                    },
                    RemoteCall::RetryPost {
                        conversation: conversation.clone(),
                        outbox_id,
                    },
                )
            }
        };
        vec![Command::Render, call]
    }

    /// Edits a text message. Identical text does nothing. A send still in
    /// flight is edited locally and the edit goes out against its outbox id;
    /// a send held for an unresolved conversation just posts the new text.
    pub fn edit(&mut self, ctx: &mut SendContext<'_>, conversation: &ConversationIdKey, ordinal: Ordinal, text: &str) -> Vec<Command> {
        let Some(message) = ctx.messages.get(conversation, ordinal) else {
            warn!(conversation = %conversation, %ordinal, "edit for unknown message");
            return vec![];
        };
        let Some(current) = message.body.as_text() else {
            warn!(conversation = %conversation, %ordinal, "only text messages can be edited");
            return vec![];
        };
        if current == text {
            debug!(conversation = %conversation, %ordinal, "edit with unchanged text");
            return vec![Command::Render];
        }
        let target = EditTarget {
            message_id: message.id,
            outbox_id: message.outbox_id.clone(),
        };

        let mut commands = Vec::new();
        if target.message_id.is_none() {
            let Some(outbox_id) = &target.outbox_id else {
                warn!(conversation = %conversation, %ordinal, "message has neither id nor outbox id");
                return vec![];
            };
            ctx.messages.set_text(conversation, ordinal, text);
            self.outbox.edit_send(outbox_id, text);
            commands.push(Command::Render);
            if conversation.is_pending() {
                return commands;
            }
        }

        let Some(tlf_name) = ctx.tlf_name(conversation) else {
            warn!(conversation = %conversation, "edit in unknown conversation");
            return commands;
        };
        let outbox_id = OutboxId::generate();
        if let Err(e) = self.outbox.track(OutboxEntry::new(
            outbox_id.clone(),
            OutboxIntent::Edit {
                target: target.clone(),
                text: text.to_owned(),
            },
            conversation.clone(),
        )) {
            error!(error = %e, "outbox id collision");
            return commands;
        }
        info!(conversation = %conversation, ?target, "editing message");
        commands.push(Command::remote(
            ReplyTag::Edit {
                conversation: conversation.clone(),
                outbox_id: outbox_id.clone(),
                target: target.clone(),
                text: text.to_owned(),
            },
            RemoteCall::PostEdit {
                conversation: conversation.clone(),
                tlf_name,
                outbox_id,
                target,
                text: text.to_owned(),
            },
        ));
        commands
    }

    pub fn on_edit_reply(
        &mut self,
        ctx: &mut SendContext<'_>,
        conversation: &ConversationIdKey,
        outbox_id: &OutboxId,
        target: &EditTarget,
        text: &str,
        result: RemoteResult,
    ) -> Vec<Command> {
        self.outbox.resolve(outbox_id);
        match result {
            Ok(_) => {
                match (target.message_id, &target.outbox_id) {
                    (Some(id), _) => ctx.messages.set_text_by_id(conversation, id, text),
                    (None, Some(sent)) => ctx.messages.set_text_by_outbox(conversation, sent, text),
                    (None, None) => false,
                };
                vec![Command::Render]
            }
            Err(e) => settle_error("edit", &e),
        }
    }

    /// Cancels a local message by outbox id, or supersedes a confirmed one.
    pub fn delete(&mut self, ctx: &mut SendContext<'_>, conversation: &ConversationIdKey, ordinal: Ordinal) -> Vec<Command> {
        let Some(message) = ctx.messages.get(conversation, ordinal) else {
            warn!(conversation = %conversation, %ordinal, "delete for unknown message");
            return vec![];
        };
        match (message.id, message.outbox_id.clone()) {
            (None, Some(outbox_id)) => {
                if conversation.is_pending() {
                    ctx.messages.mark_deleted_local(conversation, &outbox_id);
                    self.held_sends.retain(|held| held != &outbox_id);
                    self.outbox.resolve(&outbox_id);
                    return vec![Command::Render];
                }
                info!(conversation = %conversation, %outbox_id, "cancelling pending message");
                vec![Command::remote(
                    ReplyTag::Delete {
                        conversation: conversation.clone(),
                        outbox_id: outbox_id.clone(),
                        target: None,
                    },
                    RemoteCall::CancelPost {
                        conversation: conversation.clone(),
                        outbox_id,
                    },
                )]
            }
            (Some(target), _) => {
                let Some(tlf_name) = ctx.tlf_name(conversation) else {
                    warn!(conversation = %conversation, "delete in unknown conversation");
                    return vec![];
                };
                let outbox_id = OutboxId::generate();
                if self
                    .outbox
                    .track(OutboxEntry::new(
                        outbox_id.clone(),
                        OutboxIntent::Delete {
                            target: Some(target),
                        },
                        conversation.clone(),
                    ))
                    .is_err()
                {
                    return vec![];
                }
                info!(conversation = %conversation, %target, "deleting message");
                vec![Command::remote(
                    ReplyTag::Delete {
                        conversation: conversation.clone(),
                        outbox_id: outbox_id.clone(),
                        target: Some(target),
                    },
                    RemoteCall::PostDelete {
                        conversation: conversation.clone(),
                        tlf_name,
                        outbox_id,
                        target,
                    },
                )]
            }
            (None, None) => {
                warn!(conversation = %conversation, %ordinal, "message has neither id nor outbox id");
                vec![]
            }
        }
    }

    pub fn on_delete_reply(
        &mut self,
        ctx: &mut SendContext<'_>,
        conversation: &ConversationIdKey,
        outbox_id: &OutboxId,
        target: Option<MessageId>,
        result: RemoteResult,
    ) -> Vec<Command> {
        self.outbox.resolve(outbox_id);
        match result {
            Ok(_) => {
                match target {
                    Some(id) => ctx.messages.mark_deleted(conversation, &[id]),
                    None => ctx.messages.mark_deleted_local(conversation, outbox_id),
                }
                vec![Command::Render]
            }
            Err(e) => settle_error("delete", &e),
        }
    }

    /// Always issues the same toggle; the local change waits for the reply.
    pub fn toggle_reaction(&mut self, ctx: &mut SendContext<'_>, conversation: &ConversationIdKey, ordinal: Ordinal, emoji: &str) -> Vec<Command> {
        let Some(target) = ctx.messages.get(conversation, ordinal).and_then(|m| m.id) else {
            warn!(conversation = %conversation, %ordinal, "reaction target has no server id");
            return vec![];
        };
        let Some(tlf_name) = ctx.tlf_name(conversation) else {
            warn!(conversation = %conversation, "reaction in unknown conversation");
            return vec![];
        };
        let outbox_id = OutboxId::generate();
        vec![Command::remote(
            ReplyTag::Reaction {
                conversation: conversation.clone(),
                outbox_id: outbox_id.clone(),
                target,
                emoji: emoji.to_owned(),
            },
            RemoteCall::ToggleReaction {
                conversation: conversation.clone(),
                tlf_name,
                outbox_id,
                target,
                emoji: emoji.to_owned(),
            },
        )]
    }

    pub fn on_reaction_reply(
        &mut self,
        ctx: &mut SendContext<'_>,
        conversation: &ConversationIdKey,
        target: MessageId,
        emoji: &str,
        result: RemoteResult,
    ) -> Vec<Command> {
        match result {
            Ok(_) => {
                ctx.messages.toggle_reaction(conversation, target, emoji, ctx.you);
                vec![Command::Render]
            }
            Err(e) => settle_error("reaction", &e),
        }
    }

    /// Starts a sequential attachment batch: placeholders, previews, pending
    /// messages, then uploads.
    pub fn upload_attachments(&mut self, ctx: &mut SendContext<'_>, conversation: &ConversationIdKey, files: Vec<AttachmentSpec>) -> Vec<Command> {
        if files.is_empty() {
            return vec![];
        }
        if conversation.is_pending() {
            debug!(count = files.len(), "holding attachments until conversation resolves");
            self.held_uploads.push(files);
            return vec![];
        }
        let Some(tlf_name) = ctx.tlf_name(conversation).filter(|_| conversation.is_valid()) else {
            warn!(conversation = %conversation, "dropping upload to unknown conversation");
            return vec![];
        };
        let batch = self.next_batch;
        self.next_batch += 1;
        self.uploads.insert(
            batch,
            UploadBatch {
                conversation: conversation.clone(),
                tlf_name,
                files,
                outbox_ids: Vec::new(),
                previews: Vec::new(),
                uploading: 0,
                exploding_lifetime_secs: self.exploding_mode(conversation),
            },
        );
        self.next_placeholder(batch).into_iter().collect()
    }

    fn next_placeholder(&self, batch: u64) -> Option<Command> {
        let upload = self.uploads.get(&batch)?;
        Some(Command::remote(
            ReplyTag::Placeholder { batch },
            RemoteCall::AttachmentPlaceholder {
                conversation: upload.conversation.clone(),
                tlf_name: upload.tlf_name.clone(),
            },
        ))
    }

    pub fn on_placeholder_reply(&mut self, batch: u64, result: RemoteResult) -> Vec<Command> {
        let Some(upload) = self.uploads.get_mut(&batch) else {
            warn!(batch, "placeholder for unknown upload batch");
            return vec![];
        };
        match result {
            Ok(RemoteReply::Placeholder { outbox_id }) => upload.outbox_ids.push(outbox_id),
            Ok(_) => {
                self.uploads.remove(&batch);
                return vec![Command::Fail(EngineError::MissingRemoteData {
                    what: "placeholder outbox id",
                })];
            }
            Err(e) => {
                self.uploads.remove(&batch);
                return settle_error("attachment placeholder", &e);
            }
        }
        if upload.outbox_ids.len() < upload.files.len() {
            return self.next_placeholder(batch).into_iter().collect();
        }
        let file_path = upload.files[0].file_path.clone();
        vec![Command::remote(
            ReplyTag::Preview { batch },
            RemoteCall::AttachmentPreview { file_path },
        )]
    }

    pub fn on_preview_reply(&mut self, ctx: &mut SendContext<'_>, batch: u64, result: RemoteResult) -> Vec<Command> {
        let Some(upload) = self.uploads.get_mut(&batch) else {
            warn!(batch, "preview for unknown upload batch");
            return vec![];
        };
        let preview = match result {
            Ok(RemoteReply::Preview { preview_url }) => preview_url,
            Ok(_) => None,
            Err(e) => {
                warn!(batch, error = %e, "attachment preview failed");
                None
            }
        };
        upload.previews.push(preview);
        if upload.previews.len() < upload.files.len() {
            let file_path = upload.files[upload.previews.len()].file_path.clone();
            return vec![Command::remote(
                ReplyTag::Preview { batch },
                RemoteCall::AttachmentPreview { file_path },
            )];
        }

        let conversation = upload.conversation.clone();
        let exploding = upload.exploding_lifetime_secs;
        let mut entries = Vec::with_capacity(upload.files.len());
        for ((file, outbox_id), preview) in upload
            .files
            .iter()
            .zip(&upload.outbox_ids)
            .zip(upload.previews.iter_mut())
        {
            ctx.messages.insert_pending(
                &conversation,
                PendingMessage {
                    outbox_id: outbox_id.clone(),
                    author: ctx.you.clone(),
                    timestamp_ms: now_ms(),
                    body: MessageBody::Attachment {
                        title: file.title.clone(),
                        file_name: file.file_name().to_owned(),
                        preview_url: preview.take(),
                        upload_ratio: Some(0.0),
                    },
                    exploding_lifetime_secs: exploding,
                },
            );
            entries.push(OutboxEntry::new(
                outbox_id.clone(),
                OutboxIntent::Attachment {
                    file_name: file.file_name().to_owned(),
                    title: file.title.clone(),
                },
                conversation.clone(),
            ));
        }
        for entry in entries {
            if let Err(e) = self.outbox.track(entry) {
                warn!(error = %e, "attachment outbox id reused");
            }
        }
        let mut commands = vec![Command::Render];
        commands.extend(self.next_upload(batch));
        commands
    }

    fn next_upload(&mut self, batch: u64) -> Option<Command> {
        let upload = self.uploads.get(&batch)?;
        let Some(file) = upload.files.get(upload.uploading) else {
            self.uploads.remove(&batch);
            return None;
        };
        let outbox_id = upload.outbox_ids.get(upload.uploading)?.clone();
        let attempt_id = outbox_id.clone();
        info!(conversation = %upload.conversation, %outbox_id, "uploading attachment");
        let command = Command::remote(
            ReplyTag::Upload {
                batch,
                conversation: upload.conversation.clone(),
                outbox_id: outbox_id.clone(),
            },
            RemoteCall::AttachmentUpload {
                conversation: upload.conversation.clone(),
                tlf_name: upload.tlf_name.clone(),
                outbox_id,
                file_path: file.file_path.clone(),
                title: file.title.clone(),
                exploding_lifetime_secs: upload.exploding_lifetime_secs,
            },
        );
        self.count_attempt(&attempt_id);
        Some(command)
    }

    pub fn on_upload_reply(
        &mut self,
        ctx: &mut SendContext<'_>,
        batch: u64,
        conversation: &ConversationIdKey,
        outbox_id: &OutboxId,
        result: RemoteResult,
    ) -> Vec<Command> {
        let mut commands = match result {
            Ok(RemoteReply::Posted { message_id }) => {
                ctx.messages.set_upload_ratio(conversation, outbox_id, None);
                ctx.messages.mark_sent(conversation, outbox_id, message_id);
                self.outbox.resolve(outbox_id);
                vec![Command::Render]
            }
            Ok(_) => vec![Command::Fail(EngineError::MissingRemoteData {
                what: "uploaded message id",
            })],
            Err(e) => self.post_failed(ctx, conversation, outbox_id, &e),
        };
        if let Some(upload) = self.uploads.get_mut(&batch) {
            upload.uploading += 1;
        }
        commands.extend(self.next_upload(batch));
        commands
    }

    pub fn upload_started(&mut self, ctx: &mut SendContext<'_>, conversation: &ConversationIdKey, outbox_id: &OutboxId) -> Vec<Command> {
        self.outbox.reset_progress(outbox_id, UPLOAD_STARTED_RATIO);
        ctx.messages
            .set_upload_ratio(conversation, outbox_id, Some(UPLOAD_STARTED_RATIO));
        vec![Command::Render]
    }

    /// Forwards progress only when it advanced by more than the configured
    /// step.
    pub fn upload_progress(
        &mut self,
        ctx: &mut SendContext<'_>,
        conversation: &ConversationIdKey,
        outbox_id: &OutboxId,
        bytes_complete: u64,
        bytes_total: u64,
    ) -> Vec<Command> {
        if bytes_total == 0 {
            return vec![];
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = (bytes_complete as f64 / bytes_total as f64) as f32;
        match self
            .outbox
            .forward_progress(outbox_id, ratio, self.progress_step)
        {
            Some(ratio) => {
                ctx.messages
                    .set_upload_ratio(conversation, outbox_id, Some(ratio));
                vec![Command::Render]
            }
            None => vec![],
        }
    }

    /// Re-homes everything held on the pending identity and posts it.
    pub fn flush_held(&mut self, ctx: &mut SendContext<'_>, to: &ConversationIdKey) -> Vec<Command> {
        let mut commands = Vec::new();
        ctx.messages.rekey(&ConversationIdKey::Pending, to);
        self.outbox.rekey(&ConversationIdKey::Pending, to);
        if let Some(seconds) = self.exploding_modes.remove(&ConversationIdKey::Pending) {
            self.exploding_modes.insert(to.clone(), seconds);
        }

        let held = std::mem::take(&mut self.held_sends);
        if !held.is_empty() {
            let Some(tlf_name) = ctx.tlf_name(to) else {
                warn!(conversation = %to, "resolved conversation has no meta, failing held sends");
                for outbox_id in &held {
                    ctx.messages
                        .mark_failed(to, outbox_id, "conversation could not be resolved");
                }
                return vec![Command::Render];
            };
            info!(conversation = %to, count = held.len(), "flushing held sends");
            for outbox_id in held {
                let text = match self.outbox.get(&outbox_id).map(|e| &e.intent) {
                    Some(OutboxIntent::Send { text }) => text.clone(),
                    _ => continue,
                };
                let exploding = ctx
                    .messages
                    .by_outbox(to, &outbox_id)
                    .and_then(|m| m.exploding_lifetime_secs);
                commands.push(self.post_text(to, tlf_name.clone(), outbox_id, text, exploding));
            }
        }
        for files in std::mem::take(&mut self.held_uploads) {
            commands.extend(self.upload_attachments(ctx, to, files));
        }
        commands.push(Command::Render);
        commands
    }

    /// Fails everything held when the pending conversation can't be created.
    pub fn fail_held(&mut self, ctx: &mut SendContext<'_>, reason: &str) {
        for outbox_id in std::mem::take(&mut self.held_sends) {
            ctx.messages
                .mark_failed(&ConversationIdKey::Pending, &outbox_id, reason);
        }
        self.held_uploads.clear();
    }

    /// Drops everything held on the pending identity.
    pub fn discard_held(&mut self, ctx: &mut SendContext<'_>) {
        for outbox_id in std::mem::take(&mut self.held_sends) {
            self.outbox.resolve(&outbox_id);
        }
        self.held_uploads.clear();
        ctx.messages.remove_conversation(&ConversationIdKey::Pending);
        self.exploding_modes.remove(&ConversationIdKey::Pending);
    }

    /// The service wants the user to confirm a post before it goes out.
    pub fn confirm_required(&mut self, conversation: &ConversationIdKey, outbox_id: OutboxId) {
        if let Some((_, previous)) = &self.confirm_slot {
            warn!(%previous, "replacing unanswered post confirmation");
        }
        self.confirm_slot = Some((conversation.clone(), outbox_id));
    }

    pub fn confirm(&mut self, ctx: &mut SendContext<'_>, accept: bool) -> Vec<Command> {
        let Some((conversation, outbox_id)) = self.confirm_slot.take() else {
            warn!("no post is waiting for confirmation");
            return vec![];
        };
        if !accept {
            ctx.messages
                .mark_failed(&conversation, &outbox_id, "Send canceled");
        }
        vec![
            Command::Render,
            Command::fire(RemoteCall::AnswerConfirm { outbox_id, accept }),
        ]
    }
}

/// Logs a settled failure; fatal ones become a notice.
fn settle_error(what: &str, e: &RemoteError) -> Vec<Command> {
    match Notice::from_remote(e) {
        None => {
            warn!(what, error = %e, "transient failure");
            vec![]
        }
        Some(notice) => {
            error!(what, error = %e, "request rejected");
            vec![Command::Notify(notice)]
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
