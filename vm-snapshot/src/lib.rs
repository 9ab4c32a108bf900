// Copyright © 2026 The vmsnap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use thiserror::Error;

pub mod control;
pub mod state;

pub use control::{save_state, PausedMachine};
pub use state::{DeviceState, SnapshotData, State, VcpuState};

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Failed to pause virtual machine: {0}")]
    Pause(#[source] anyhow::Error),

    #[error("Failed to read vCPU state: {0}")]
    VcpuRead(#[source] anyhow::Error),

    #[error("Failed to read device state: {0}")]
    DeviceRead(#[source] anyhow::Error),

    #[error("Failed to resume virtual machine: {0}")]
    Resume(#[source] anyhow::Error),

    #[error("Failed to encode snapshot section: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode snapshot section: {0}")]
    Decode(#[source] serde_json::Error),
}

/// A Pausable component can stop and restart the execution of all its
/// virtual CPUs.
pub trait Pausable {
    /// Pause the component.
    ///
    /// A `full` pause is synchronous: it does not return before every vCPU
    /// has acknowledged it is stopped. Without `full`, the vCPUs are only
    /// told to stop.
    fn pause(&self, full: bool) -> anyhow::Result<()>;

    /// Resume the component.
    ///
    /// A `full` resume does not return before every vCPU has left its
    /// paused state.
    fn resume(&self, full: bool) -> anyhow::Result<()>;
}

/// Source of the per-vCPU state of a paused machine.
pub trait VcpuStateSource {
    /// Return one state per vCPU, in vCPU enumeration order.
    ///
    /// This is all or nothing: if a single vCPU cannot be read, an error is
    /// returned and no state at all.
    fn vcpu_states(&self) -> anyhow::Result<Vec<VcpuState>>;
}

/// A machine that can be snapshotted: its vCPUs can be stopped and then
/// read.
pub trait Machine: Pausable + VcpuStateSource {}

impl<T: Pausable + VcpuStateSource + ?Sized> Machine for T {}

/// Source of the per-device state of a machine's device model.
pub trait DeviceStateSource<M: ?Sized> {
    /// Return one state per device, in device enumeration order.
    ///
    /// This blocks until every device has quiesced, i.e. no request issued
    /// by a vCPU before the machine was paused is still in flight.
    fn device_states(&self, machine: &M) -> anyhow::Result<Vec<DeviceState>>;
}
