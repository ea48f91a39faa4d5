//! Persistent backend identity
//!
//! Every backend directory carries an `id.conf` sidecar with a v4 UUID. It is
//! generated on first open and reused afterwards; the UUID is the backend's
//! node name on the wire.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

/// Name of the identity sidecar
pub const ID_CONF: &str = "id.conf";

#[derive(Debug, Serialize, Deserialize)]
struct BackendIdentifier {
    uuid: String,
}

/// Read the backend UUID from `dir`, creating it if missing or unreadable.
pub fn get_or_create_uuid(dir: &Path) -> Result<Uuid> {
    let path = dir.join(ID_CONF);

    if let Ok(text) = fs::read_to_string(&path) {
        match toml::from_str::<BackendIdentifier>(&text)
            .ok()
            .and_then(|id| Uuid::parse_str(&id.uuid).ok())
        {
            Some(uuid) => return Ok(uuid),
            None => warn!("Unreadable identity in {:?}, generating a new one", path),
        }
    }

    let uuid = Uuid::new_v4();
    let ident = BackendIdentifier {
        uuid: uuid.hyphenated().to_string(),
    };
    let text = toml::to_string(&ident)
        .map_err(|e| crate::BlobError::Config(e.to_string()))?;
    fs::write(&path, text)?;
    info!("Created backend identity {} in {:?}", uuid, dir);

    Ok(uuid)
}
