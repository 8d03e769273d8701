//! Chat messages in the OpenAI-compatible multimodal format.

use serde::{Deserialize, Serialize};

use crate::perception::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// One part of a multimodal message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: Vec<ContentPart>,
}

impl ChatMessage {
    fn text_message(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentPart::Text { text: text.into() }],
        }
    }

    /// Create a system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self::text_message(MessageRole::System, text)
    }

    /// Create a user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::text_message(MessageRole::User, text)
    }

    /// Create an assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text_message(MessageRole::Assistant, text)
    }

    /// Append a screenshot to the message.
    pub fn with_frame(mut self, frame: &Frame) -> Self {
        self.content.push(ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: frame.data_url(),
            },
        });
        self
    }

    /// Append a labelled screenshot (label text followed by the image).
    pub fn with_labelled_frame(mut self, label: &str, frame: &Frame) -> Self {
        self.content.push(ContentPart::Text {
            text: label.to_string(),
        });
        self.with_frame(frame)
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn image_count(&self) -> usize {
        self.content
            .iter()
            .filter(|part| matches!(part, ContentPart::ImageUrl { .. }))
            .count()
    }

    /// Drop image parts to keep the context small.
    pub fn strip_images(&mut self) {
        self.content
            .retain(|part| !matches!(part, ContentPart::ImageUrl { .. }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::{normalize, ImageBudget};
    use image::{DynamicImage, RgbImage};

    #[test]
    fn test_message_builder() {
        let frame = normalize(
            &DynamicImage::ImageRgb8(RgbImage::new(56, 56)),
            &ImageBudget::default(),
        )
        .unwrap();

        let mut msg = ChatMessage::user("Hello").with_frame(&frame);
        assert_eq!(msg.image_count(), 1);

        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["role"], "user");
        assert_eq!(wire["content"][0]["type"], "text");
        assert_eq!(wire["content"][1]["type"], "image_url");
        assert!(wire["content"][1]["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));

        msg.strip_images();
        assert_eq!(msg.image_count(), 0);
        assert_eq!(msg.text(), "Hello");
    }
}
