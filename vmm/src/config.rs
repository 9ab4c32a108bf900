// Copyright © 2026 The vmsnap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::HashSet;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_VCPUS: u8 = 1;
pub const MAX_VCPUS: u8 = 64;
pub const DEFAULT_DEVICE_LATENCY_MS: u64 = 2;
pub const DEFAULT_QUIESCE_TIMEOUT_MS: u64 = 1000;

/// Errors associated with VM configuration parameters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// No vCPU to boot
    #[error("No vCPUs to boot")]
    CpusNoBootVcpus,
    /// Too many vCPUs
    #[error("Number of boot vCPUs {0} exceeds the maximum")]
    CpusMaxExceeded(u8),
    /// Device id is empty
    #[error("Device identifier cannot be empty")]
    DeviceIdEmpty,
    /// Two devices share an id
    #[error("Identifier {0} is not unique")]
    DeviceIdNotUnique(String),
}

type ValidationResult<T> = std::result::Result<T, ValidationError>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpusConfig {
    pub boot_vcpus: u8,
}

impl Default for CpusConfig {
    fn default() -> Self {
        CpusConfig {
            boot_vcpus: DEFAULT_VCPUS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    pub id: String,
    /// Time the device takes to complete one request.
    pub latency: Duration,
}

impl DeviceConfig {
    pub fn new(id: &str) -> Self {
        DeviceConfig {
            id: id.to_owned(),
            latency: Duration::from_millis(DEFAULT_DEVICE_LATENCY_MS),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmConfig {
    pub cpus: CpusConfig,
    /// Devices, in the order they are plugged on the I/O bus.
    pub devices: Vec<DeviceConfig>,
    /// Upper bound for draining one device's in-flight requests when its
    /// state is captured.
    pub quiesce_timeout: Duration,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            cpus: CpusConfig::default(),
            devices: Vec::new(),
            quiesce_timeout: Duration::from_millis(DEFAULT_QUIESCE_TIMEOUT_MS),
        }
    }
}

impl VmConfig {
    pub fn validate(&self) -> ValidationResult<()> {
        if self.cpus.boot_vcpus == 0 {
            return Err(ValidationError::CpusNoBootVcpus);
        }
        if self.cpus.boot_vcpus > MAX_VCPUS {
            return Err(ValidationError::CpusMaxExceeded(self.cpus.boot_vcpus));
        }

        let mut id_list = HashSet::new();
        for device in self.devices.iter() {
            if device.id.is_empty() {
                return Err(ValidationError::DeviceIdEmpty);
            }
            if !id_list.insert(device.id.as_str()) {
                return Err(ValidationError::DeviceIdNotUnique(device.id.clone()));
            }
        }

        Ok(())
    }
}
