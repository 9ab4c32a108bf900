// Copyright © 2026 The vmsnap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vm_snapshot::{DeviceState, DeviceStateSource};

use crate::config::{DeviceConfig, VmConfig};
use crate::Vm;

/// Errors associated with device manager
#[derive(Debug, Error)]
pub enum DeviceManagerError {
    /// Cannot spawn the device worker thread.
    #[error("Failed to spawn worker thread for device {0}")]
    DeviceSpawn(String, #[source] io::Error),

    /// Failed to join on a device worker thread.
    #[error("Failed to join worker thread of device {0}")]
    ThreadCleanup(String),

    /// Request sent to a device which has been shut down.
    #[error("Device {0} is shut down")]
    DeviceShutdown(String),

    /// Outstanding requests did not complete in time.
    #[error("Device {0} did not quiesce within {1:?}")]
    QuiesceTimeout(String, Duration),
}
pub type DeviceManagerResult<T> = std::result::Result<T, DeviceManagerError>;

/// An I/O request issued by a vCPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoRequest {
    pub vcpu_id: u8,
    pub value: u64,
}

/// Device state, as recorded in a snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceSnapshotState {
    pub id: String,
    /// Number of requests fully processed.
    pub completed: u64,
    pub accumulator: u64,
    pub last_vcpu: Option<u8>,
}

#[derive(Default)]
struct DeviceRegisters {
    completed: u64,
    accumulator: u64,
    last_vcpu: Option<u8>,
}

impl DeviceRegisters {
    fn process(&mut self, request: IoRequest) {
        self.completed += 1;
        self.accumulator = self.accumulator.rotate_left(7) ^ request.value;
        self.last_vcpu = Some(request.vcpu_id);
    }
}

/// Number of requests submitted and not yet processed.
type InFlight = (Mutex<u64>, Condvar);

pub struct Device {
    id: String,
    registers: Arc<Mutex<DeviceRegisters>>,
    in_flight: Arc<InFlight>,
    sender: Mutex<Option<flume::Sender<IoRequest>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Device {
    pub fn new(config: &DeviceConfig) -> DeviceManagerResult<Self> {
        let registers = Arc::new(Mutex::new(DeviceRegisters::default()));
        let in_flight: Arc<InFlight> = Arc::new((Mutex::new(0), Condvar::new()));
        let (sender, receiver) = flume::unbounded::<IoRequest>();

        let handle = {
            let registers = registers.clone();
            let in_flight = in_flight.clone();
            let latency = config.latency;

            thread::Builder::new()
                .name(format!("dev-{}", config.id))
                .spawn(move || {
                    // Ends once every sender is gone and the queue is drained.
                    for request in receiver.iter() {
                        thread::sleep(latency);
                        registers.lock().unwrap().process(request);

                        let (count, completed) = &*in_flight;
                        *count.lock().unwrap() -= 1;
                        completed.notify_all();
                    }
                })
                .map_err(|e| DeviceManagerError::DeviceSpawn(config.id.clone(), e))?
        };

        Ok(Device {
            id: config.id.clone(),
            registers,
            in_flight,
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a request. It completes asynchronously on the device thread.
    pub fn submit(&self, request: IoRequest) -> DeviceManagerResult<()> {
        let sender = self.sender.lock().unwrap();
        let sender = sender
            .as_ref()
            .ok_or_else(|| DeviceManagerError::DeviceShutdown(self.id.clone()))?;

        *self.in_flight.0.lock().unwrap() += 1;
        if sender.send(request).is_err() {
            *self.in_flight.0.lock().unwrap() -= 1;
            return Err(DeviceManagerError::DeviceShutdown(self.id.clone()));
        }

        Ok(())
    }

    pub fn in_flight(&self) -> u64 {
        *self.in_flight.0.lock().unwrap()
    }

    /// Wait for all outstanding requests to complete, for at most `timeout`.
    pub fn quiesce(&self, timeout: Duration) -> DeviceManagerResult<()> {
        let start = Instant::now();
        let (count, completed) = &*self.in_flight;
        let (count, result) = completed
            .wait_timeout_while(count.lock().unwrap(), timeout, |count| *count > 0)
            .unwrap();

        if result.timed_out() && *count > 0 {
            warn!(
                "Device {} still has {} request(s) in flight after {:?}",
                self.id,
                *count,
                start.elapsed()
            );
            return Err(DeviceManagerError::QuiesceTimeout(self.id.clone(), timeout));
        }

        Ok(())
    }

    pub fn snapshot_state(&self) -> DeviceSnapshotState {
        let registers = self.registers.lock().unwrap();
        DeviceSnapshotState {
            id: self.id.clone(),
            completed: registers.completed,
            accumulator: registers.accumulator,
            last_vcpu: registers.last_vcpu,
        }
    }

    /// Stop accepting requests, finish the queued ones and join the device
    /// thread.
    pub fn shutdown(&self) -> DeviceManagerResult<()> {
        self.sender.lock().unwrap().take();

        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle
                .join()
                .map_err(|_| DeviceManagerError::ThreadCleanup(self.id.clone()))?;
        }

        Ok(())
    }
}

/// Routes vCPU requests to devices.
#[derive(Default)]
pub struct IoBus {
    devices: Vec<Arc<Device>>,
}

impl IoBus {
    pub fn new(devices: Vec<Arc<Device>>) -> Self {
        IoBus { devices }
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// Send `request` to device `slot` modulo the number of devices.
    pub fn dispatch(&self, slot: u64, request: IoRequest) -> DeviceManagerResult<()> {
        if self.devices.is_empty() {
            return Ok(());
        }
        let index = (slot % self.devices.len() as u64) as usize;
        self.devices[index].submit(request)
    }
}

pub struct DeviceManager {
    io_bus: Arc<IoBus>,
    quiesce_timeout: Duration,
}

impl DeviceManager {
    pub fn new(config: &VmConfig) -> DeviceManagerResult<Self> {
        let mut devices = Vec::with_capacity(config.devices.len());
        for device_cfg in config.devices.iter() {
            info!("Creating device {}", device_cfg.id);
            devices.push(Arc::new(Device::new(device_cfg)?));
        }

        Ok(DeviceManager {
            io_bus: Arc::new(IoBus::new(devices)),
            quiesce_timeout: config.quiesce_timeout,
        })
    }

    pub fn io_bus(&self) -> &Arc<IoBus> {
        &self.io_bus
    }

    /// Wait for every device to finish its outstanding requests.
    pub fn quiesce(&self) -> DeviceManagerResult<()> {
        for device in self.io_bus.devices() {
            device.quiesce(self.quiesce_timeout)?;
        }
        Ok(())
    }

    pub fn shutdown(&self) -> DeviceManagerResult<()> {
        for device in self.io_bus.devices() {
            debug!("Shutting down device {}", device.id());
            device.shutdown()?;
        }
        Ok(())
    }
}

impl DeviceStateSource<Vm> for DeviceManager {
    fn device_states(&self, vm: &Vm) -> anyhow::Result<Vec<DeviceState>> {
        // Running vCPUs would keep feeding the devices.
        if !vm.vcpus_paused() {
            return Err(anyhow!("vCPUs are not paused"));
        }

        self.quiesce()?;

        let mut states = Vec::with_capacity(self.io_bus.devices().len());
        for device in self.io_bus.devices() {
            states.push(DeviceState::new_from_state(&device.snapshot_state())?);
        }
        Ok(states)
    }
}
