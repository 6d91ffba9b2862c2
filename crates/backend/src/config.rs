use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use models::{FamilyId, VariantId};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read backend config")]
    Io(#[from] std::io::Error),
    #[error("malformed backend config")]
    Parse(#[from] serde_json::Error),
}

/// Static configuration of one backend: which id family it registers
/// under and which slot families it hosts.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Family prefix of the permanent id (`mini` → `mini1`, `mini2`, ...).
    pub id_family: String,
    /// Total player capacity reported in heartbeats.
    #[serde(default = "default_max_players")]
    pub max_players: u32,
    /// How long an empty slot may idle before it drains.
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
    pub families: Vec<FamilyConfig>,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyConfig {
    pub family_id: FamilyId,
    pub max_slots: u32,
    pub variants: BTreeMap<VariantId, VariantConfig>,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantConfig {
    #[serde(default = "default_max_occupants")]
    pub max_occupants: u32,
}

fn default_max_players() -> u32 {
    100
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_max_occupants() -> u32 {
    16
}

impl BackendConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    pub fn family(&self, id: &FamilyId) -> Option<&FamilyConfig> {
        self.families.iter().find(|family| &family.family_id == id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_a_full_config() {
        let config: BackendConfig = serde_json::from_str(
            r#"{
                "idFamily": "mini",
                "maxPlayers": 80,
                "idleTimeout": "5m",
                "families": [
                    {
                        "familyId": "skywars",
                        "maxSlots": 4,
                        "variants": {
                            "duos": {"maxOccupants": 8},
                            "solos": {}
                        }
                    }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.id_family, "mini");
        assert_eq!(config.max_players, 80);
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        let family = config.family(&"skywars".into()).unwrap();
        assert_eq!(family.max_slots, 4);
        assert_eq!(family.variants[&"duos".into()].max_occupants, 8);
        assert_eq!(family.variants[&"solos".into()].max_occupants, 16);
    }
}
