use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollNetConfig {
    // the collective network is opt-in
    pub enable: bool,
}
