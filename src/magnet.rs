//! Handle magnet links.
use std::ops::Deref;

use magnet_url::Magnet as Magnet_;

use crate::{error::Error, session::InfoHash};

#[derive(Debug, Clone)]
pub struct Magnet(Magnet_);

impl Deref for Magnet {
    type Target = Magnet_;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Magnet {
    /// Parse a magnet link. Surfaces user errors before any session runs.
    pub fn new(magnet_url: &str) -> Result<Self, Error> {
        let magnet = Magnet_::new(magnet_url)?;

        let Some(xt) = magnet.hash() else {
            return Err(Error::MagnetNoInfoHash);
        };
        if hex::decode(xt).map(|v| v.len()) != Ok(20) {
            return Err(Error::MagnetNoInfoHash);
        }

        Ok(Self(magnet))
    }

    /// The display name comes URL encoded and is optional.
    pub fn name(&self) -> String {
        if let Some(dn) = self.0.display_name() {
            if let Ok(dn) = urlencoding::decode(dn) {
                return dn.to_string();
            }
        }
        "Unknown".to_owned()
    }

    /// The "xt" field, decoded from hex. Validated at construction.
    pub fn info_hash(&self) -> InfoHash {
        let buf = hex::decode(self.0.hash().unwrap()).unwrap();
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&buf[..20]);
        hash.into()
    }

    /// UDP trackers as "host:port" strings, scheme and path stripped.
    pub fn udp_trackers(&self) -> Vec<String> {
        self.0
            .trackers()
            .iter()
            .filter_map(|t| {
                let t = urlencoding::decode(t).ok()?;
                let uri = t.strip_prefix("udp://")?;
                let uri = match uri.find('/') {
                    Some(i) => &uri[..i],
                    None => uri,
                };
                Some(uri.to_owned())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGNET: &str = "magnet:?xt=urn:btih:9f9165d9a281a9b8e782cd5176bbcc8256fd1871&dn=My%20Torrent&tr=udp%3A%2F%2Ftracker.example.com%3A6969%2Fannounce&tr=udp%3A%2F%2Ftracker2.example.com%3A1337&tr=http%3A%2F%2Ftracker3.example.com%2Fannounce";

    #[test]
    fn parses_fields() {
        let m = Magnet::new(MAGNET).unwrap();

        assert_eq!(m.name(), "My Torrent");
        assert_eq!(
            m.info_hash().to_string(),
            "9f9165d9a281a9b8e782cd5176bbcc8256fd1871"
        );
        assert_eq!(
            m.udp_trackers(),
            vec![
                "tracker.example.com:6969".to_owned(),
                "tracker2.example.com:1337".to_owned(),
            ]
        );
    }

    #[test]
    fn rejects_magnet_without_hash() {
        assert!(Magnet::new("magnet:?dn=nothing").is_err());
    }
}
