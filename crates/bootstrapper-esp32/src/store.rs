//! Device record in NVS flash.
//!
//! The record is kept as one JSON string under a fixed key, the same
//! document the host keeps in `setup.json`.

use bootstrapper_core::{ConfigError, ConfigStore, DeviceConfigRecord};
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use log::warn;
use std::sync::{Mutex, MutexGuard, PoisonError};

const NAMESPACE: &str = "bootstrap";
const RECORD_KEY: &str = "setup";

/// Upper bound for the stored JSON document.
const MAX_RECORD_LEN: usize = 1024;

pub struct NvsConfigStore {
    nvs: Mutex<EspNvs<NvsDefault>>,
}

impl NvsConfigStore {
    pub fn new(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NAMESPACE, true)?;
        Ok(Self {
            nvs: Mutex::new(nvs),
        })
    }

    fn nvs(&self) -> MutexGuard<'_, EspNvs<NvsDefault>> {
        self.nvs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConfigStore for NvsConfigStore {
    fn load_record(&self) -> Result<DeviceConfigRecord, ConfigError> {
        let nvs = self.nvs();
        let mut buf = vec![0u8; MAX_RECORD_LEN];
        match nvs.get_str(RECORD_KEY, &mut buf) {
            Ok(Some(json)) => {
                serde_json::from_str(json).map_err(|e| ConfigError::InvalidData(e.to_string()))
            }
            Ok(None) => Err(ConfigError::NotFound(format!("{NAMESPACE}/{RECORD_KEY}"))),
            Err(e) => Err(ConfigError::ReadError(e.to_string())),
        }
    }

    fn save_record(&self, record: &DeviceConfigRecord) -> Result<(), ConfigError> {
        let json =
            serde_json::to_string(record).map_err(|e| ConfigError::InvalidData(e.to_string()))?;
        if json.len() >= MAX_RECORD_LEN {
            return Err(ConfigError::WriteError(format!(
                "record is {} bytes, limit {MAX_RECORD_LEN}",
                json.len()
            )));
        }
        self.nvs()
            .set_str(RECORD_KEY, &json)
            .map_err(|e| ConfigError::WriteError(e.to_string()))
    }

    fn exists(&self) -> bool {
        match self.nvs().contains(RECORD_KEY) {
            Ok(found) => found,
            Err(e) => {
                warn!("NVS lookup failed: {}", e);
                false
            }
        }
    }

    fn erase(&self) -> Result<(), ConfigError> {
        self.nvs()
            .remove(RECORD_KEY)
            .map(|_| ())
            .map_err(|e| ConfigError::WriteError(e.to_string()))
    }
}
