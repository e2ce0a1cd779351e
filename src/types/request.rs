//! Payloads of the requests issued by the connection itself.

use serde::Serialize;
use uuid::Uuid;

use super::ClientDescriptor;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionInitRequest<'a> {
    pub device_id: Uuid,
    pub user_agent: &'a ClientDescriptor,
}

/// Token login, answered with the bulk state sync.
///
/// The `*Sync` markers are the last-seen timestamps; zero asks for a full snapshot.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SyncRequest<'a> {
    pub interactive: bool,
    pub token: &'a str,
    pub chats_sync: i64,
    pub contacts_sync: i64,
    pub presence_sync: i64,
    pub drafts_sync: i64,
    pub chats_count: u32,
}

impl<'a> SyncRequest<'a> {
    pub(crate) fn full(token: &'a str, chats_count: u32) -> Self {
        Self {
            interactive: true,
            token,
            chats_sync: 0,
            contacts_sync: 0,
            presence_sync: 0,
            drafts_sync: 0,
            chats_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct PingRequest {
    pub interactive: bool,
}
