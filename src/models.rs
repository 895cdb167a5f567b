#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Session {
    // spotify bearer credential, present only after a successful code
    // exchange or refresh. `None` means this browser session is
    // unauthenticated.
    pub access_token: Option<String>,
    // credential for silently re-acquiring an access token. stored
    // whenever spotify supplies one, both on the initial exchange and
    // when a refresh rotates it.
    pub refresh_token: Option<String>,
    // when this session record was first created
    pub created: chrono::DateTime<chrono::Utc>,
}

impl Session {
    pub fn new() -> Self {
        Session {
            access_token: None,
            refresh_token: None,
            created: chrono::Utc::now(),
        }
    }

    /// Drop both credentials, returning the session to the
    /// unauthenticated state.
    pub fn clear_tokens(&mut self) {
        self.access_token = None;
        self.refresh_token = None;
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PlaylistImage {
    pub url: String,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub width: Option<u32>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PlaylistOwner {
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Playlist {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner: Option<PlaylistOwner>,
    // spotify reports cover art as a list of differently sized images.
    // playlists without cover art come back with an empty list or null.
    #[serde(default)]
    pub images: Option<Vec<PlaylistImage>>,
}

impl Playlist {
    /// A playlist is worth rendering only when spotify reports at least
    /// one cover image for it.
    pub fn is_displayable(&self) -> bool {
        self.images.as_ref().map(|i| !i.is_empty()).unwrap_or(false)
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct PlaylistsPage {
    pub items: Vec<Playlist>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playlist(images: Option<Vec<PlaylistImage>>) -> Playlist {
        Playlist {
            id: "p1".to_string(),
            name: "morning mix".to_string(),
            owner: None,
            images,
        }
    }

    #[test]
    fn playlist_with_cover_art_is_displayable() {
        let p = playlist(Some(vec![PlaylistImage {
            url: "https://i.scdn.co/image/abc".to_string(),
            height: Some(300),
            width: Some(300),
        }]));
        assert!(p.is_displayable());
    }

    #[test]
    fn playlist_with_empty_image_list_is_not_displayable() {
        assert!(!playlist(Some(vec![])).is_displayable());
    }

    #[test]
    fn playlist_without_images_is_not_displayable() {
        assert!(!playlist(None).is_displayable());
    }

    #[test]
    fn null_images_deserialize_as_absent() {
        let p: Playlist = serde_json::from_str(r#"{"id":"x","name":"n","images":null}"#)
            .expect("playlist should deserialize");
        assert!(!p.is_displayable());
    }

    #[test]
    fn new_session_is_unauthenticated() {
        let s = Session::new();
        assert!(s.access_token.is_none());
        assert!(s.refresh_token.is_none());
    }

    #[test]
    fn clear_tokens_drops_both_credentials() {
        let mut s = Session::new();
        s.access_token = Some("access".to_string());
        s.refresh_token = Some("refresh".to_string());
        s.clear_tokens();
        assert!(s.access_token.is_none());
        assert!(s.refresh_token.is_none());
    }
}
