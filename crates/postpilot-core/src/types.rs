//! Shared types — the vocabulary the whole workspace speaks.

use serde::{Deserialize, Serialize};

/// Target social network. One adapter exists per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Facebook,
    Instagram,
    Linkedin,
    Twitter,
}

impl Platform {
    /// Stable lowercase name, used in storage keys and config sections.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Facebook => "facebook",
            Platform::Instagram => "instagram",
            Platform::Linkedin => "linkedin",
            Platform::Twitter => "twitter",
        }
    }

    /// All supported platforms.
    pub fn all() -> [Platform; 4] {
        [
            Platform::Facebook,
            Platform::Instagram,
            Platform::Linkedin,
            Platform::Twitter,
        ]
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = crate::error::PostPilotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "facebook" => Ok(Platform::Facebook),
            "instagram" => Ok(Platform::Instagram),
            "linkedin" => Ok(Platform::Linkedin),
            "twitter" | "x" => Ok(Platform::Twitter),
            other => Err(crate::error::PostPilotError::Validation(format!(
                "unknown platform: '{other}'"
            ))),
        }
    }
}

/// The content of a scheduled post. Opaque to the engine — authored
/// upstream, handed to the provider adapter verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostPayload {
    pub title: String,
    pub body: String,
    /// Public URL of an attached image, if any.
    #[serde(default)]
    pub image_url: Option<String>,
    /// Website link to include with the post, if any.
    #[serde(default)]
    pub link_url: Option<String>,
}

impl PostPayload {
    pub fn new(title: &str, body: &str) -> Self {
        Self {
            title: title.to_string(),
            body: body.to_string(),
            image_url: None,
            link_url: None,
        }
    }

    /// Text actually sent to the provider: body, with the link appended
    /// when the platform has no separate link field.
    pub fn text_with_link(&self) -> String {
        match &self.link_url {
            Some(link) => format!("{}\n{}", self.body, link),
            None => self.body.clone(),
        }
    }
}
