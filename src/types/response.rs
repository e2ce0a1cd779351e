//! Server-side values: pushed messages, conversations and the sync snapshot.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::serde_helpers::{deserialize_with_warnings, id_from_any};
use crate::ws::envelope::{Envelope, Opcode};
use crate::ws::traits::EventParser;

/// Conversation kind as reported by the sync.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, strum_macros::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatType {
    /// One-to-one conversation
    Dialog,
    /// Group chat
    Chat,
    Channel,
}

impl ChatType {
    fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "DIALOG" => Some(Self::Dialog),
            "CHAT" => Some(Self::Chat),
            "CHANNEL" => Some(Self::Channel),
            _ => None,
        }
    }
}

/// Link from a message to another one, e.g. the message it replies to.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageLink {
    /// `REPLY` or `FORWARD`
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub chat_id: Option<i64>,
    /// The linked message, left undecoded
    #[serde(default)]
    pub message: Option<Value>,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(deserialize_with = "id_from_any")]
    pub id: i64,
    #[serde(default)]
    pub sender: Option<i64>,
    #[serde(default)]
    pub text: String,
    /// Milliseconds since the Unix epoch
    #[serde(default)]
    pub time: i64,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    /// Set on edits (`EDITED`) and deletions (`REMOVED`)
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub attaches: Vec<Value>,
    #[serde(default)]
    pub elements: Vec<Value>,
    #[serde(default)]
    pub link: Option<MessageLink>,
}

impl Message {
    #[must_use]
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.time)
    }
}

/// Payload of a [`Opcode::NOTIF_MESSAGE`] push.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    /// Missing for messages in the "Saved messages" dialog
    #[serde(default)]
    pub chat_id: Option<i64>,
    pub message: Message,
}

impl MessageEvent {
    /// The message this one replies to, when it carries a `REPLY` link.
    #[must_use]
    pub fn reply_to(&self) -> Option<&Value> {
        self.message
            .link
            .as_ref()
            .filter(|link| link.kind == "REPLY")
            .and_then(|link| link.message.as_ref())
    }

    /// Chat the message belongs to.
    ///
    /// The server omits `chatId` for the "Saved messages" dialog, whose id equals the
    /// account's own profile id. The fallback applies only to messages sent by `me`.
    #[must_use]
    pub fn resolved_chat_id(&self, me: Option<&Profile>) -> Option<i64> {
        self.chat_id.or_else(|| {
            me.filter(|profile| self.message.sender == Some(profile.id))
                .map(|profile| profile.id)
        })
    }
}

/// Conversation entry from the sync snapshot.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    #[serde(deserialize_with = "id_from_any")]
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ChatType,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub owner: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub participants_count: Option<u64>,
    #[serde(default)]
    pub last_event_time: Option<i64>,
    #[serde(default)]
    pub last_message: Option<Message>,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileName {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// The account's own contact card, from `profile.contact` in the sync.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(deserialize_with = "id_from_any")]
    pub id: i64,
    #[serde(default)]
    pub names: Vec<ProfileName>,
    #[serde(default)]
    pub phone: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Profile {
    #[must_use]
    pub fn display_name(&self) -> Option<String> {
        let name = self.names.first()?;
        if let Some(full) = &name.name {
            return Some(full.clone());
        }
        match (&name.first_name, &name.last_name) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            (Some(only), None) | (None, Some(only)) => Some(only.clone()),
            (None, None) => None,
        }
    }
}

/// Snapshot returned by the initial sync.
///
/// Every entity is decoded on its own: a malformed entry is logged, counted in
/// [`SyncState::skipped`] and left out, and never fails the sync as a whole.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncState {
    pub dialogs: Vec<Chat>,
    pub chats: Vec<Chat>,
    pub channels: Vec<Chat>,
    pub me: Option<Profile>,
    /// Entries dropped because they could not be decoded
    pub skipped: usize,
}

impl SyncState {
    #[must_use]
    pub fn from_payload(payload: &Value) -> Self {
        let mut state = Self::default();

        for raw in payload
            .get("chats")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let kind = raw.get("type").and_then(Value::as_str);
            let target = match kind.and_then(ChatType::from_wire) {
                Some(ChatType::Dialog) => &mut state.dialogs,
                Some(ChatType::Chat) => &mut state.chats,
                Some(ChatType::Channel) => &mut state.channels,
                None => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(chat_type = ?kind, "skipping chat of unknown type");
                    continue;
                }
            };

            match deserialize_with_warnings::<Chat>(raw.clone()) {
                Ok(chat) => target.push(chat),
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "skipping malformed chat entry");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                    state.skipped += 1;
                }
            }
        }

        if let Some(contact) = payload.pointer("/profile/contact") {
            match deserialize_with_warnings::<Profile>(contact.clone()) {
                Ok(profile) => state.me = Some(profile),
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "skipping malformed profile");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                    state.skipped += 1;
                }
            }
        }

        state
    }

    /// Look a conversation up by id across dialogs, chats and channels.
    #[must_use]
    pub fn find_chat(&self, id: i64) -> Option<&Chat> {
        self.dialogs
            .iter()
            .chain(&self.chats)
            .chain(&self.channels)
            .find(|chat| chat.id == id)
    }
}

/// Push notification decoded by [`NotificationParser`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A new message
    Message(MessageEvent),
    /// An existing message was edited or removed
    MessageUpdate(MessageEvent),
    /// Any other push, passed through undecoded
    Notification(Envelope),
}

impl Event {
    /// The new message carried by this event, if any.
    #[must_use]
    pub fn as_message(&self) -> Option<&MessageEvent> {
        match self {
            Self::Message(event) => Some(event),
            _ => None,
        }
    }
}

/// Default push decoder: message notifications become [`Event::Message`] or
/// [`Event::MessageUpdate`], everything else passes through as [`Event::Notification`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct NotificationParser;

impl EventParser<Event> for NotificationParser {
    fn parse(&self, envelope: &Envelope) -> crate::Result<Option<Event>> {
        if envelope.opcode != Opcode::NOTIF_MESSAGE {
            return Ok(Some(Event::Notification(envelope.clone())));
        }

        let event: MessageEvent = deserialize_with_warnings(envelope.payload.clone())?;
        if event.message.status.is_some() {
            Ok(Some(Event::MessageUpdate(event)))
        } else {
            Ok(Some(Event::Message(event)))
        }
    }
}
