//! Runtime-tunable product settings.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::backupstore::BackupTarget;
use crate::error::{ManagerError, Result};

pub const BACKUP_TARGET: &str = "backup-target";
pub const BACKUP_TARGET_CREDENTIAL_SECRET: &str = "backup-target-credential-secret";
pub const DEFAULT_REPLICA_COUNT: &str = "default-replica-count";
pub const AUTO_SALVAGE: &str = "auto-salvage";
pub const STORAGE_OVER_PROVISIONING_PERCENTAGE: &str = "storage-over-provisioning-percentage";
pub const STORAGE_MINIMAL_AVAILABLE_PERCENTAGE: &str = "storage-minimal-available-percentage";
pub const STORAGE_RESERVED_PERCENTAGE_FOR_DEFAULT_DISK: &str =
    "storage-reserved-percentage-for-default-disk";
pub const DEFAULT_DATA_PATH: &str = "default-data-path";
pub const REPLICA_SOFT_ANTI_AFFINITY: &str = "replica-soft-anti-affinity";
pub const DEFAULT_ENGINE_IMAGE: &str = "default-engine-image";

/// Share of a default disk held back from replica scheduling.
pub const DEFAULT_STORAGE_RESERVED_PERCENTAGE: u64 = 30;

/// Upper bound for `storage-over-provisioning-percentage`.
pub const MAX_OVER_PROVISIONING_PERCENTAGE: u64 = 10_000;

/// Upper bound for `default-replica-count` and per-volume replica counts.
pub const MAX_REPLICA_COUNT: u32 = 20;

/// Setting shared between the API, the scheduler and the volume actors.
pub type SharedSettings = Arc<RwLock<Settings>>;

/// One setting as exposed over the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setting {
    pub name: String,
    pub value: String,
    pub default: String,
}

/// Typed settings registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub backup_target: String,
    pub backup_target_credential_secret: String,
    pub default_replica_count: u32,
    pub auto_salvage: bool,
    pub storage_over_provisioning_percentage: u64,
    pub storage_minimal_available_percentage: u64,
    pub storage_reserved_percentage_for_default_disk: u64,
    pub default_data_path: String,
    pub replica_soft_anti_affinity: bool,
    pub default_engine_image: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backup_target: String::new(),
            backup_target_credential_secret: String::new(),
            default_replica_count: 3,
            auto_salvage: true,
            storage_over_provisioning_percentage: 500,
            storage_minimal_available_percentage: 10,
            storage_reserved_percentage_for_default_disk: DEFAULT_STORAGE_RESERVED_PERCENTAGE,
            default_data_path: "/var/lib/holdfast/".to_string(),
            replica_soft_anti_affinity: false,
            default_engine_image: "holdfast/engine:v1".to_string(),
        }
    }
}

impl Settings {
    /// All setting names in display order.
    pub const NAMES: [&'static str; 10] = [
        BACKUP_TARGET,
        BACKUP_TARGET_CREDENTIAL_SECRET,
        DEFAULT_REPLICA_COUNT,
        AUTO_SALVAGE,
        STORAGE_OVER_PROVISIONING_PERCENTAGE,
        STORAGE_MINIMAL_AVAILABLE_PERCENTAGE,
        STORAGE_RESERVED_PERCENTAGE_FOR_DEFAULT_DISK,
        DEFAULT_DATA_PATH,
        REPLICA_SOFT_ANTI_AFFINITY,
        DEFAULT_ENGINE_IMAGE,
    ];

    pub fn shared(self) -> SharedSettings {
        Arc::new(RwLock::new(self))
    }

    /// Current value of a setting rendered as a string.
    pub fn value(&self, name: &str) -> Result<String> {
        let value = match name {
            BACKUP_TARGET => self.backup_target.clone(),
            BACKUP_TARGET_CREDENTIAL_SECRET => self.backup_target_credential_secret.clone(),
            DEFAULT_REPLICA_COUNT => self.default_replica_count.to_string(),
            AUTO_SALVAGE => self.auto_salvage.to_string(),
            STORAGE_OVER_PROVISIONING_PERCENTAGE => {
                self.storage_over_provisioning_percentage.to_string()
            }
            STORAGE_MINIMAL_AVAILABLE_PERCENTAGE => {
                self.storage_minimal_available_percentage.to_string()
            }
            STORAGE_RESERVED_PERCENTAGE_FOR_DEFAULT_DISK => {
                self.storage_reserved_percentage_for_default_disk.to_string()
            }
            DEFAULT_DATA_PATH => self.default_data_path.clone(),
            REPLICA_SOFT_ANTI_AFFINITY => self.replica_soft_anti_affinity.to_string(),
            DEFAULT_ENGINE_IMAGE => self.default_engine_image.clone(),
            other => return Err(ManagerError::not_found("setting", other)),
        };
        Ok(value)
    }

    pub fn get(&self, name: &str) -> Result<Setting> {
        let value = self.value(name)?;
        let default = Settings::default().value(name)?;
        Ok(Setting {
            name: name.to_string(),
            value,
            default,
        })
    }

    pub fn list(&self) -> Vec<Setting> {
        Self::NAMES
            .iter()
            .filter_map(|name| self.get(name).ok())
            .collect()
    }

    /// Validates and applies a new value.
    pub fn set(&mut self, name: &str, value: &str) -> Result<Setting> {
        match name {
            BACKUP_TARGET => {
                if !value.is_empty() {
                    BackupTarget::parse(value)?;
                }
                self.backup_target = value.to_string();
            }
            BACKUP_TARGET_CREDENTIAL_SECRET => {
                self.backup_target_credential_secret = value.to_string();
            }
            DEFAULT_REPLICA_COUNT => {
                let count: u32 = parse_value(name, value)?;
                if count == 0 || count > MAX_REPLICA_COUNT {
                    return Err(ManagerError::invalid_argument(format!(
                        "{name} must be between 1 and {MAX_REPLICA_COUNT}"
                    )));
                }
                self.default_replica_count = count;
            }
            AUTO_SALVAGE => self.auto_salvage = parse_value(name, value)?,
            STORAGE_OVER_PROVISIONING_PERCENTAGE => {
                let pct: u64 = parse_value(name, value)?;
                if pct > MAX_OVER_PROVISIONING_PERCENTAGE {
                    return Err(ManagerError::invalid_argument(format!(
                        "{name} must be between 0 and {MAX_OVER_PROVISIONING_PERCENTAGE}"
                    )));
                }
                self.storage_over_provisioning_percentage = pct;
            }
            STORAGE_MINIMAL_AVAILABLE_PERCENTAGE => {
                self.storage_minimal_available_percentage = parse_percentage(name, value)?;
            }
            STORAGE_RESERVED_PERCENTAGE_FOR_DEFAULT_DISK => {
                self.storage_reserved_percentage_for_default_disk =
                    parse_percentage(name, value)?;
            }
            DEFAULT_DATA_PATH => {
                if !value.starts_with('/') {
                    return Err(ManagerError::invalid_argument(format!(
                        "{name} must be an absolute path"
                    )));
                }
                self.default_data_path = value.to_string();
            }
            REPLICA_SOFT_ANTI_AFFINITY => {
                self.replica_soft_anti_affinity = parse_value(name, value)?;
            }
            DEFAULT_ENGINE_IMAGE => {
                if value.is_empty() {
                    return Err(ManagerError::invalid_argument(format!(
                        "{name} cannot be empty"
                    )));
                }
                self.default_engine_image = value.to_string();
            }
            other => return Err(ManagerError::not_found("setting", other)),
        }
        self.get(name)
    }
}

fn parse_value<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        ManagerError::invalid_argument(format!("invalid value '{value}' for setting {name}"))
    })
}

fn parse_percentage(name: &str, value: &str) -> Result<u64> {
    let pct: u64 = parse_value(name, value)?;
    if pct > 100 {
        return Err(ManagerError::invalid_argument(format!(
            "{name} must be between 0 and 100"
        )));
    }
    Ok(pct)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.value(DEFAULT_REPLICA_COUNT).unwrap(), "3");
        assert_eq!(settings.value(AUTO_SALVAGE).unwrap(), "true");
        assert_eq!(
            settings
                .value(STORAGE_RESERVED_PERCENTAGE_FOR_DEFAULT_DISK)
                .unwrap(),
            "30"
        );
        assert_eq!(settings.list().len(), Settings::NAMES.len());
    }

    #[test]
    fn test_set_validates() {
        let mut settings = Settings::default();
        assert!(settings.set(DEFAULT_REPLICA_COUNT, "0").is_err());
        assert!(settings.set(DEFAULT_REPLICA_COUNT, "abc").is_err());
        assert!(settings.set(STORAGE_MINIMAL_AVAILABLE_PERCENTAGE, "101").is_err());
        assert!(settings
            .set(STORAGE_OVER_PROVISIONING_PERCENTAGE, "18446744073709551615")
            .is_err());
        assert!(settings.set(STORAGE_OVER_PROVISIONING_PERCENTAGE, "10001").is_err());
        settings.set(STORAGE_OVER_PROVISIONING_PERCENTAGE, "200").unwrap();
        assert_eq!(settings.storage_over_provisioning_percentage, 200);
        assert!(settings.set(BACKUP_TARGET, "ftp://nowhere").is_err());
        assert!(settings.set("no-such-setting", "1").is_err());

        let updated = settings.set(AUTO_SALVAGE, "false").unwrap();
        assert_eq!(updated.value, "false");
        assert_eq!(updated.default, "true");
        assert!(!settings.auto_salvage);

        settings.set(BACKUP_TARGET, "s3://backups@us-east-1/").unwrap();
        settings.set(BACKUP_TARGET, "").unwrap();
        assert!(settings.backup_target.is_empty());
    }
}
