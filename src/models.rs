use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationRef {
    pub id: String,
    pub name: String,
}

/// One entry of a Shoutcast directory listing.
///
/// Field names follow the XML attributes: `br`, `ct`, `genre`, `id`, `lc`,
/// `mt`, `name`. Only `id` and `name` are guaranteed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Station {
    pub id: String,
    pub name: String,
    pub bitrate: Option<String>,
    pub current_track: Option<String>,
    pub genre: Option<String>,
    pub listeners: Option<String>,
    pub media_type: Option<String>,
}

impl Station {
    pub fn bitrate_kbps(&self) -> Option<u32> {
        self.bitrate.as_deref().and_then(|b| b.trim().parse().ok())
    }

    pub fn listener_count(&self) -> Option<u32> {
        self.listeners.as_deref().and_then(|l| l.trim().parse().ok())
    }

    pub fn to_ref(&self) -> StationRef {
        StationRef {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

/// Which page the popup shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum View {
    #[default]
    Playlist,
    Shoutcast,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StationListing {
    pub tunein_base: Option<String>,
    pub stations: Vec<Station>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_attributes_parse_leniently() {
        let st = Station {
            id: "1".into(),
            name: "A".into(),
            bitrate: Some(" 128".into()),
            listeners: Some("n/a".into()),
            ..Default::default()
        };
        assert_eq!(st.bitrate_kbps(), Some(128));
        assert_eq!(st.listener_count(), None);
        assert_eq!(st.to_ref().id, "1");
    }
}
