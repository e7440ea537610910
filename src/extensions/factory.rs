use std::str::FromStr;

use crate::extensions::{
    ExtensionHandler, ExtensionType, metadata::MetadataHandler, pex::PexHandler,
};

pub struct ExtensionFactory;

impl ExtensionFactory {
    pub fn build(name: &str) -> Option<Box<dyn ExtensionHandler>> {
        match ExtensionType::from_str(name).ok()? {
            ExtensionType::Pex => Some(Box::new(PexHandler)),
            ExtensionType::Metadata => Some(Box::new(MetadataHandler)),
            // the handshake isn't handled by a sub-protocol handler
            ExtensionType::Handshake => None,
        }
    }
}
