// Copyright © 2026 The vmsnap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};

use crate::SnapshotError;

/// A snapshot section.
///
/// The section holds the serialized state of one component, as produced by
/// that component. Nothing in this crate looks inside it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SnapshotData {
    state: String,
}

impl SnapshotData {
    /// Generate the state data from the snapshot data
    pub fn to_state<'a, T>(&'a self) -> Result<T, SnapshotError>
    where
        T: Deserialize<'a>,
    {
        serde_json::from_str(&self.state).map_err(SnapshotError::Decode)
    }

    /// Create from state that can be serialized
    pub fn new_from_state<T>(state: &T) -> Result<Self, SnapshotError>
    where
        T: Serialize,
    {
        let state = serde_json::to_string(state).map_err(SnapshotError::Encode)?;

        Ok(SnapshotData { state })
    }
}

/// Architectural state of one vCPU at the moment of capture.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct VcpuState(SnapshotData);

impl VcpuState {
    pub fn new(data: SnapshotData) -> Self {
        VcpuState(data)
    }

    pub fn new_from_state<T: Serialize>(state: &T) -> Result<Self, SnapshotError> {
        SnapshotData::new_from_state(state).map(VcpuState)
    }

    pub fn data(&self) -> &SnapshotData {
        &self.0
    }
}

/// Internal state of one device at the moment of capture.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DeviceState(SnapshotData);

impl DeviceState {
    pub fn new(data: SnapshotData) -> Self {
        DeviceState(data)
    }

    pub fn new_from_state<T: Serialize>(state: &T) -> Result<Self, SnapshotError> {
        SnapshotData::new_from_state(state).map(DeviceState)
    }

    pub fn data(&self) -> &SnapshotData {
        &self.0
    }
}

/// A point in time capture of a whole machine.
///
/// Entries are kept in the order the vCPU and device sources enumerated
/// them. That order is the only link between an entry and the vCPU or device
/// it was captured from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct State {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    devices: Vec<DeviceState>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    vcpus: Vec<VcpuState>,
}

impl State {
    pub(crate) fn new(vcpus: Vec<VcpuState>, devices: Vec<DeviceState>) -> Self {
        State { devices, vcpus }
    }

    pub fn vcpus(&self) -> &[VcpuState] {
        &self.vcpus
    }

    pub fn devices(&self) -> &[DeviceState] {
        &self.devices
    }

    /// Give up the state, returning the vCPU and device entries.
    pub fn into_parts(self) -> (Vec<VcpuState>, Vec<DeviceState>) {
        (self.vcpus, self.devices)
    }
}
