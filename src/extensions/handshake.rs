use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{config::PeerConfig, extensions::ACTIVE_EXTENSIONS};

/// The bencoded dictionary sent with sub-id 0.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HandshakeExtension {
    /// extension name -> sub-id the sender wants to receive it with; 0 disables it.
    /// Ids of extensions we don't know may be anything, the known ones are checked later.
    #[serde(default)]
    pub m: HashMap<String, i64>,
    /// Local TCP listen port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<u16>,
    /// Client name and version. Not always utf-8.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_bytes"
    )]
    pub v: Option<Vec<u8>>,
    /// Size of the info dictionary in bytes, only sent by peers that have it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<u32>,
    /// An integer, the number of outstanding request messages this client supports without dropping any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqq: Option<u32>,
    /// The compact representation of the ip address this peer sees you as.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_bytes"
    )]
    pub yourip: Option<Vec<u8>>,
}

impl HandshakeExtension {
    pub fn local(config: &PeerConfig) -> Self {
        let m = ACTIVE_EXTENSIONS
            .iter()
            .map(|ext| (ext.to_string(), *ext as i64))
            .collect();
        Self {
            m,
            p: (config.listen_port != 0).then_some(config.listen_port),
            v: Some(config.client_name.clone().into_bytes()),
            metadata_size: config.metadata_size,
            reqq: None,
            yourip: None,
        }
    }

    pub fn client(&self) -> Option<String> {
        self.v
            .as_deref()
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }
}
