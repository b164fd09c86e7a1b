//! Message bodies and system-notice effects.
//!
//! A message's payload depends on its type: text carries content, image
//! carries a public URL, file carries metadata, and system notices carry an
//! action phrase plus an effect. [`MessageBody`] makes those combinations the
//! only representable ones.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::UserId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
            MessageKind::System => "system",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        match s {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "file" => Ok(MessageKind::File),
            "system" => Ok(MessageKind::System),
            other => Err(ProtocolError::UnsupportedType(other.to_string())),
        }
    }
}

/// Metadata of a file attachment. The bytes live in external storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    pub mime: String,
    pub url: String,
}

/// What a system notice refers to: affected members, or a literal value
/// such as a new group name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SystemEffect {
    Users { users: Vec<UserId> },
    Data { text: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text { content: String },
    Image { image_url: String },
    File(FileMetadata),
    System { action: String, effect: SystemEffect },
}

impl MessageBody {
    /// Build a body from the loosely-typed fields of a client payload.
    ///
    /// Clients may only send text, image, or file messages.
    pub fn from_client(
        kind: MessageKind,
        content: Option<String>,
        image_url: Option<String>,
        file: Option<FileMetadata>,
    ) -> Result<Self, ProtocolError> {
        match kind {
            MessageKind::Text => {
                let content = content.ok_or(ProtocolError::MissingField("content"))?;
                if content.trim().is_empty() {
                    return Err(ProtocolError::EmptyField("content"));
                }
                Ok(MessageBody::Text { content })
            }
            MessageKind::Image => {
                let image_url = image_url.ok_or(ProtocolError::MissingField("imageUrl"))?;
                if image_url.trim().is_empty() {
                    return Err(ProtocolError::EmptyField("imageUrl"));
                }
                Ok(MessageBody::Image { image_url })
            }
            MessageKind::File => {
                let file = file.ok_or(ProtocolError::MissingField("fileMetadata"))?;
                if file.url.trim().is_empty() {
                    return Err(ProtocolError::EmptyField("fileMetadata.url"));
                }
                Ok(MessageBody::File(file))
            }
            MessageKind::System => Err(ProtocolError::UnsupportedType(
                MessageKind::System.as_str().to_string(),
            )),
        }
    }

    pub fn system(action: impl Into<String>, effect: SystemEffect) -> Self {
        MessageBody::System {
            action: action.into(),
            effect,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Text { .. } => MessageKind::Text,
            MessageBody::Image { .. } => MessageKind::Image,
            MessageBody::File(_) => MessageKind::File,
            MessageBody::System { .. } => MessageKind::System,
        }
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            MessageBody::Text { content } => Some(content),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_requires_content() {
        let err = MessageBody::from_client(MessageKind::Text, None, None, None).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField("content")));

        let err = MessageBody::from_client(MessageKind::Text, Some("   ".into()), None, None)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::EmptyField("content")));
    }

    #[test]
    fn test_image_requires_url() {
        let body = MessageBody::from_client(
            MessageKind::Image,
            None,
            Some("https://img.example/a.png".into()),
            None,
        )
        .unwrap();
        assert_eq!(body.kind(), MessageKind::Image);
        assert!(body.content().is_none());

        assert!(MessageBody::from_client(MessageKind::Image, Some("x".into()), None, None).is_err());
    }

    #[test]
    fn test_clients_cannot_send_system_notices() {
        let err = MessageBody::from_client(MessageKind::System, Some("hi".into()), None, None)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedType(_)));
    }

    #[test]
    fn test_effect_is_tagged_on_the_wire() {
        let users = SystemEffect::Users {
            users: vec![UserId::new()],
        };
        let json = serde_json::to_value(&users).unwrap();
        assert_eq!(json["kind"], "users");

        let data = SystemEffect::Data {
            text: "Weekend".into(),
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["kind"], "data");
        assert_eq!(json["text"], "Weekend");
    }
}
