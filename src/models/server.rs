use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a configured media server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId(pub Uuid);

impl ServerId {
    pub fn new() -> Self {
        ServerId(Uuid::new_v4())
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Media server family. Each variant has its own adapter (out of scope for
/// the core — spec.md §1) but the variant tag still lives on `Server` since
/// the lifecycle engine is variant-agnostic and never branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerVariant {
    Plex,
    Jellyfin,
    Emby,
}

impl ServerVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerVariant::Plex => "plex",
            ServerVariant::Jellyfin => "jellyfin",
            ServerVariant::Emby => "emby",
        }
    }

    /// Only plex exposes a server-push event stream (spec.md §6); the others
    /// are poll-only.
    pub fn supports_push(&self) -> bool {
        matches!(self, ServerVariant::Plex)
    }
}

/// A configured media server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub name: String,
    pub variant: ServerVariant,
    pub base_url: String,
    pub access_token: String,
    pub machine_identifier: Option<String>,
}

impl Server {
    pub fn new(
        name: impl Into<String>,
        variant: ServerVariant,
        base_url: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Server {
            id: ServerId::new(),
            name: name.into(),
            variant,
            base_url: base_url.into(),
            access_token: access_token.into(),
            machine_identifier: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plex_supports_push_others_do_not() {
        assert!(ServerVariant::Plex.supports_push());
        assert!(!ServerVariant::Jellyfin.supports_push());
        assert!(!ServerVariant::Emby.supports_push());
    }

    #[test]
    fn variant_as_str_round_trips_serde_rename() {
        assert_eq!(ServerVariant::Plex.as_str(), "plex");
        assert_eq!(ServerVariant::Jellyfin.as_str(), "jellyfin");
        assert_eq!(ServerVariant::Emby.as_str(), "emby");
    }

    #[test]
    fn new_server_gets_a_fresh_id() {
        let a = Server::new("a", ServerVariant::Plex, "http://a", "tok");
        let b = Server::new("b", ServerVariant::Plex, "http://b", "tok");
        assert_ne!(a.id, b.id);
    }
}
