use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmTransportConfig {
    pub enable: bool,
    // which side hosts the data buffers
    pub locality: ShmLocality,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShmLocality {
    Sender,
    Receiver,
}

impl Default for ShmTransportConfig {
    fn default() -> Self {
        ShmTransportConfig {
            enable: true,
            locality: ShmLocality::Sender,
        }
    }
}
