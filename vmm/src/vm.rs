// Copyright © 2026 The vmsnap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::io::Write;
use std::sync::{Arc, Mutex, RwLock};
use std::{io, result};

use serde::Serialize;
use thiserror::Error;
use vm_snapshot::{Pausable, SnapshotError, State, VcpuState, VcpuStateSource};

use crate::config::{ValidationError, VmConfig};
use crate::cpu::{self, CpuManager};
use crate::device_manager::{DeviceManager, DeviceManagerError};

/// Errors associated with VM management
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid VM configuration: {0}")]
    ConfigValidation(#[source] ValidationError),

    #[error("Error from device manager: {0}")]
    DeviceManager(#[source] DeviceManagerError),

    #[error("Error from CPU manager: {0}")]
    CpuManager(#[source] cpu::Error),

    #[error("Invalid VM state transition: {0:?} to {1:?}")]
    InvalidStateTransition(VmState, VmState),

    #[error("Error taking VM snapshot: {0}")]
    Snapshot(#[source] SnapshotError),

    #[error("Error serializing VM snapshot: {0}")]
    SnapshotSerialize(#[source] serde_json::Error),

    #[error("Error writing VM snapshot: {0}")]
    SnapshotWrite(#[source] io::Error),
}
pub type Result<T> = result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum VmState {
    Created,
    Running,
    Paused,
    Shutdown,
}

impl VmState {
    fn valid_transition(self, new_state: VmState) -> Result<()> {
        match self {
            VmState::Created => match new_state {
                VmState::Running | VmState::Shutdown => Ok(()),
                VmState::Created | VmState::Paused => {
                    Err(Error::InvalidStateTransition(self, new_state))
                }
            },

            VmState::Running => match new_state {
                VmState::Paused | VmState::Shutdown => Ok(()),
                VmState::Created | VmState::Running => {
                    Err(Error::InvalidStateTransition(self, new_state))
                }
            },

            VmState::Paused => match new_state {
                VmState::Running | VmState::Shutdown => Ok(()),
                VmState::Created | VmState::Paused => {
                    Err(Error::InvalidStateTransition(self, new_state))
                }
            },

            VmState::Shutdown => Err(Error::InvalidStateTransition(self, new_state)),
        }
    }
}

pub struct Vm {
    cpu_manager: Arc<Mutex<CpuManager>>,
    device_manager: DeviceManager,
    state: RwLock<VmState>,
}

impl Vm {
    pub fn new(config: &VmConfig) -> Result<Self> {
        config.validate().map_err(Error::ConfigValidation)?;

        let device_manager = DeviceManager::new(config).map_err(Error::DeviceManager)?;
        let cpu_manager = CpuManager::new(
            config.cpus.boot_vcpus,
            device_manager.io_bus().clone(),
        );

        Ok(Vm {
            cpu_manager,
            device_manager,
            state: RwLock::new(VmState::Created),
        })
    }

    pub fn state(&self) -> VmState {
        *self.state.read().unwrap()
    }

    pub fn boot(&self) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let new_state = VmState::Running;
        state.valid_transition(new_state)?;
        if *state != VmState::Created {
            return Err(Error::InvalidStateTransition(*state, new_state));
        }

        self.cpu_manager
            .lock()
            .unwrap()
            .start_boot_vcpus()
            .map_err(Error::CpuManager)?;

        *state = new_state;
        Ok(())
    }

    /// Stop the VM on behalf of the user, until `resume` is called.
    pub fn pause(&self) -> Result<()> {
        // Hold the state lock until the transition is committed, so that
        // concurrent callers cannot both act on the CPU pause count.
        let mut state = self.state.write().unwrap();
        let new_state = VmState::Paused;
        state.valid_transition(new_state)?;

        self.cpu_manager
            .lock()
            .unwrap()
            .pause(true)
            .map_err(Error::CpuManager)?;

        *state = new_state;
        info!("VM paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let new_state = VmState::Running;
        state.valid_transition(new_state)?;
        if *state != VmState::Paused {
            return Err(Error::InvalidStateTransition(*state, new_state));
        }

        self.cpu_manager
            .lock()
            .unwrap()
            .resume(true)
            .map_err(Error::CpuManager)?;

        *state = new_state;
        info!("VM resumed");
        Ok(())
    }

    /// Whether all vCPUs are currently stopped.
    pub fn vcpus_paused(&self) -> bool {
        self.cpu_manager.lock().unwrap().paused()
    }

    /// Capture the VM state. The VM is left running or paused, as it was.
    pub fn snapshot(&self) -> Result<State> {
        let state =
            vm_snapshot::save_state(self, &self.device_manager).map_err(Error::Snapshot)?;
        info!(
            "VM snapshotted: {} vCPU(s), {} device(s)",
            state.vcpus().len(),
            state.devices().len()
        );
        Ok(state)
    }

    pub fn shutdown(&self) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let new_state = VmState::Shutdown;
        state.valid_transition(new_state)?;
        *state = new_state;
        drop(state);

        self.cpu_manager
            .lock()
            .unwrap()
            .shutdown()
            .map_err(Error::CpuManager)?;
        self.device_manager
            .shutdown()
            .map_err(Error::DeviceManager)?;

        info!("VM shut down");
        Ok(())
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        if self.state() != VmState::Shutdown {
            if let Err(e) = self.shutdown() {
                warn!("Error shutting down VM: {}", e);
            }
        }
    }
}

impl Pausable for Vm {
    fn pause(&self, full: bool) -> anyhow::Result<()> {
        self.cpu_manager.lock().unwrap().pause(full)?;
        Ok(())
    }

    fn resume(&self, full: bool) -> anyhow::Result<()> {
        self.cpu_manager.lock().unwrap().resume(full)?;
        Ok(())
    }
}

impl VcpuStateSource for Vm {
    fn vcpu_states(&self) -> anyhow::Result<Vec<VcpuState>> {
        Ok(self.cpu_manager.lock().unwrap().vcpu_states()?)
    }
}

/// Write `state` to `writer` as pretty printed JSON.
pub fn write_state<W: Write>(state: &State, mut writer: W) -> Result<()> {
    serde_json::to_writer_pretty(&mut writer, state).map_err(Error::SnapshotSerialize)?;
    writer.write_all(b"\n").map_err(Error::SnapshotWrite)?;
    writer.flush().map_err(Error::SnapshotWrite)
}
