//! Values exchanged with the Max service: who is connecting, what the server sends back.
//!
//! Commonly used external types are re-exported so applications do not need to add
//! these dependencies to their own `Cargo.toml`.

pub(crate) mod request;
pub mod response;

use bon::Builder;
/// Timestamps attached to messages and journal entries.
pub use chrono::{DateTime, Utc};
/// Secret string type that redacts the session token in debug output.
pub use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
/// Device identifiers are random UUIDs persisted by the application.
pub use uuid::Uuid;

pub use self::response::{
    Chat, ChatType, Event, Message, MessageEvent, MessageLink, NotificationParser, Profile,
    ProfileName, SyncState,
};

/// Credentials presented during the handshake.
///
/// Acquiring the token (SMS login, QR scan) is the application's business. The device id
/// should be stored alongside it, since the server binds sessions to the device.
///
/// # Example
///
/// ```
/// use max_client_sdk::types::{Identity, Uuid};
///
/// let identity = Identity::builder()
///     .device_id(Uuid::nil())
///     .token("an.opaque.session.token")
///     .build();
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Identity {
    /// Defaults to a fresh random id
    #[builder(default = Uuid::new_v4())]
    pub device_id: Uuid,
    #[builder(into)]
    pub token: SecretString,
}

/// Client description sent as `userAgent` in the session-init request.
///
/// The defaults describe the web client, which is what the server expects from a
/// connection opened with the `https://web.max.ru` origin.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientDescriptor {
    #[builder(into, default = String::from("WEB"))]
    pub device_type: String,
    #[builder(into, default = String::from("ru"))]
    pub locale: String,
    #[builder(into, default = String::from("ru"))]
    pub device_locale: String,
    #[builder(into, default = String::from("Linux"))]
    pub os_version: String,
    #[builder(into, default = String::from("Chrome"))]
    pub device_name: String,
    #[builder(
        into,
        default = String::from(
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/139.0.0.0 Safari/537.36"
        )
    )]
    pub header_user_agent: String,
    #[builder(into, default = String::from("25.9.15"))]
    pub app_version: String,
    #[builder(into, default = String::from("1080x1920 1.0x"))]
    pub screen: String,
    #[builder(into, default = String::from("Europe/Moscow"))]
    pub timezone: String,
}

impl Default for ClientDescriptor {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn descriptor_should_serialize_camel_case() {
        let descriptor = ClientDescriptor::builder().locale("en").build();
        let value = serde_json::to_value(&descriptor).unwrap();

        assert_eq!(value["deviceType"], json!("WEB"));
        assert_eq!(value["locale"], json!("en"));
        assert_eq!(value["headerUserAgent"].as_str().map(|ua| ua.starts_with("Mozilla")), Some(true));
        assert!(value.get("device_type").is_none());
    }

    #[test]
    fn identity_debug_should_redact_token() {
        let identity = Identity::builder().token("super-secret").build();

        assert_eq!(identity.token.expose_secret(), "super-secret");
        assert!(!format!("{identity:?}").contains("super-secret"));
    }
}
