// Copyright © 2026 The vmsnap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use log::{debug, error, info};

use crate::state::State;
use crate::{DeviceStateSource, Machine, Pausable, SnapshotError};

/// A machine whose vCPUs have been fully paused.
///
/// The pause is released exactly once: either through [`PausedMachine::resume`]
/// or, on any other path, when the guard is dropped.
pub struct PausedMachine<'a, M: Pausable + ?Sized> {
    machine: &'a M,
    resumed: bool,
}

impl<'a, M: Pausable + ?Sized> PausedMachine<'a, M> {
    /// Fully pause `machine`. Nothing needs to be undone if this fails.
    pub fn pause(machine: &'a M) -> Result<Self, SnapshotError> {
        machine.pause(true).map_err(SnapshotError::Pause)?;

        Ok(PausedMachine {
            machine,
            resumed: false,
        })
    }

    /// Resume the machine, reporting whether resuming worked.
    pub fn resume(mut self) -> Result<(), SnapshotError> {
        self.resumed = true;
        self.machine.resume(true).map_err(SnapshotError::Resume)
    }
}

impl<M: Pausable + ?Sized> Drop for PausedMachine<'_, M> {
    fn drop(&mut self) {
        if self.resumed {
            return;
        }
        self.resumed = true;

        if let Err(e) = self.machine.resume(true) {
            error!("Failed to resume virtual machine after aborted snapshot: {:?}", e);
        }
    }
}

/// Capture the vCPU and device state of `machine` as one consistent [`State`].
///
/// The vCPUs are paused for the duration of the call. Whatever happens once
/// the pause went through, the machine is resumed before this returns.
pub fn save_state<M, D>(machine: &M, model: &D) -> Result<State, SnapshotError>
where
    M: Machine + ?Sized,
    D: DeviceStateSource<M> + ?Sized,
{
    info!("Snapshotting virtual machine");

    let paused = PausedMachine::pause(machine)?;

    let vcpus = machine.vcpu_states().map_err(SnapshotError::VcpuRead)?;
    debug!("Captured {} vCPU state(s)", vcpus.len());

    // Blocks until all requests the vCPUs issued before the pause are done.
    let devices = model
        .device_states(machine)
        .map_err(SnapshotError::DeviceRead)?;
    debug!("Captured {} device state(s)", devices.len());

    paused.resume()?;

    Ok(State::new(vcpus, devices))
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use anyhow::anyhow;

    use super::*;
    use crate::{DeviceState, VcpuState, VcpuStateSource};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Pause(bool),
        Resume(bool),
        VcpuStates,
        DeviceStates,
    }

    #[derive(Default)]
    struct TestMachine {
        vcpus: Vec<&'static str>,
        pause_error: Option<&'static str>,
        resume_error: Option<&'static str>,
        vcpu_error: Option<&'static str>,
        paused: Cell<bool>,
        calls: RefCell<Vec<Call>>,
    }

    impl TestMachine {
        fn with_vcpus(vcpus: &[&'static str]) -> Self {
            TestMachine {
                vcpus: vcpus.to_vec(),
                ..Default::default()
            }
        }

        fn count(&self, call: Call) -> usize {
            self.calls.borrow().iter().filter(|c| **c == call).count()
        }

        fn resume_count(&self) -> usize {
            self.count(Call::Resume(true)) + self.count(Call::Resume(false))
        }
    }

    impl Pausable for TestMachine {
        fn pause(&self, full: bool) -> anyhow::Result<()> {
            self.calls.borrow_mut().push(Call::Pause(full));
            if let Some(e) = self.pause_error {
                return Err(anyhow!(e));
            }
            self.paused.set(true);
            Ok(())
        }

        fn resume(&self, full: bool) -> anyhow::Result<()> {
            self.calls.borrow_mut().push(Call::Resume(full));
            if let Some(e) = self.resume_error {
                return Err(anyhow!(e));
            }
            self.paused.set(false);
            Ok(())
        }
    }

    impl VcpuStateSource for TestMachine {
        fn vcpu_states(&self) -> anyhow::Result<Vec<VcpuState>> {
            self.calls.borrow_mut().push(Call::VcpuStates);
            assert!(self.paused.get(), "vCPU state read while running");
            if let Some(e) = self.vcpu_error {
                return Err(anyhow!(e));
            }
            self.vcpus
                .iter()
                .map(|v| VcpuState::new_from_state(v).map_err(anyhow::Error::from))
                .collect()
        }
    }

    #[derive(Default)]
    struct TestDeviceModel {
        devices: Vec<&'static str>,
        error: Option<&'static str>,
    }

    impl DeviceStateSource<TestMachine> for TestDeviceModel {
        fn device_states(&self, machine: &TestMachine) -> anyhow::Result<Vec<DeviceState>> {
            machine.calls.borrow_mut().push(Call::DeviceStates);
            assert!(machine.paused.get(), "device state read while running");
            if let Some(e) = self.error {
                return Err(anyhow!(e));
            }
            self.devices
                .iter()
                .map(|d| DeviceState::new_from_state(d).map_err(anyhow::Error::from))
                .collect()
        }
    }

    fn decoded_vcpus(state: &State) -> Vec<String> {
        state
            .vcpus()
            .iter()
            .map(|v| v.data().to_state().unwrap())
            .collect()
    }

    fn decoded_devices(state: &State) -> Vec<String> {
        state
            .devices()
            .iter()
            .map(|d| d.data().to_state().unwrap())
            .collect()
    }

    #[test]
    fn test_save_state() {
        let machine = TestMachine::with_vcpus(&["v0", "v1"]);
        let model = TestDeviceModel {
            devices: vec!["d0"],
            ..Default::default()
        };

        let state = save_state(&machine, &model).unwrap();

        assert_eq!(decoded_vcpus(&state), vec!["v0", "v1"]);
        assert_eq!(decoded_devices(&state), vec!["d0"]);
        assert_eq!(
            *machine.calls.borrow(),
            vec![
                Call::Pause(true),
                Call::VcpuStates,
                Call::DeviceStates,
                Call::Resume(true)
            ]
        );
        assert!(!machine.paused.get());
    }

    #[test]
    fn test_save_state_keeps_source_order() {
        let vcpus = ["v3", "v0", "v2", "v1", "v7", "v5"];
        let devices = ["serial", "rng", "net1", "net0", "block"];
        let machine = TestMachine::with_vcpus(&vcpus);
        let model = TestDeviceModel {
            devices: devices.to_vec(),
            ..Default::default()
        };

        let state = save_state(&machine, &model).unwrap();

        assert_eq!(state.vcpus().len(), vcpus.len());
        assert_eq!(state.devices().len(), devices.len());
        assert_eq!(decoded_vcpus(&state), vcpus);
        assert_eq!(decoded_devices(&state), devices);
    }

    #[test]
    fn test_save_state_empty_machine() {
        let machine = TestMachine::default();
        let model = TestDeviceModel::default();

        let state = save_state(&machine, &model).unwrap();

        assert!(state.vcpus().is_empty());
        assert!(state.devices().is_empty());
        assert_eq!(machine.resume_count(), 1);
    }

    #[test]
    fn test_pause_failure_does_not_resume() {
        let machine = TestMachine {
            pause_error: Some("busy"),
            ..TestMachine::with_vcpus(&["v0"])
        };
        let model = TestDeviceModel::default();

        let err = save_state(&machine, &model).unwrap_err();

        match err {
            SnapshotError::Pause(e) => assert_eq!(e.to_string(), "busy"),
            e => panic!("unexpected error: {e:?}"),
        }
        assert_eq!(machine.resume_count(), 0);
        assert_eq!(machine.count(Call::VcpuStates), 0);
        assert_eq!(machine.count(Call::DeviceStates), 0);
    }

    #[test]
    fn test_vcpu_failure_resumes_once() {
        let machine = TestMachine {
            vcpu_error: Some("fault"),
            ..TestMachine::with_vcpus(&["v0", "v1"])
        };
        let model = TestDeviceModel {
            devices: vec!["d0"],
            ..Default::default()
        };

        let err = save_state(&machine, &model).unwrap_err();

        match err {
            SnapshotError::VcpuRead(e) => assert_eq!(e.to_string(), "fault"),
            e => panic!("unexpected error: {e:?}"),
        }
        assert_eq!(machine.resume_count(), 1);
        assert_eq!(machine.count(Call::DeviceStates), 0);
        assert!(!machine.paused.get());
    }

    #[test]
    fn test_device_failure_resumes_once() {
        let machine = TestMachine::with_vcpus(&["v0"]);
        let model = TestDeviceModel {
            devices: vec!["d0"],
            error: Some("device did not quiesce"),
        };

        let err = save_state(&machine, &model).unwrap_err();

        assert!(matches!(err, SnapshotError::DeviceRead(_)));
        assert_eq!(
            err.to_string(),
            "Failed to read device state: device did not quiesce"
        );
        assert_eq!(machine.resume_count(), 1);
        assert_eq!(
            machine.calls.borrow().last().copied(),
            Some(Call::Resume(true))
        );
    }

    #[test]
    fn test_resume_failure_is_reported() {
        let machine = TestMachine {
            resume_error: Some("vcpu0 did not restart"),
            ..TestMachine::with_vcpus(&["v0"])
        };
        let model = TestDeviceModel::default();

        let err = save_state(&machine, &model).unwrap_err();

        assert!(matches!(err, SnapshotError::Resume(_)));
        assert_eq!(machine.resume_count(), 1);
    }

    #[test]
    fn test_resume_failure_on_error_path_keeps_capture_error() {
        let machine = TestMachine {
            vcpu_error: Some("fault"),
            resume_error: Some("stuck"),
            ..TestMachine::with_vcpus(&["v0"])
        };
        let model = TestDeviceModel::default();

        let err = save_state(&machine, &model).unwrap_err();

        assert!(matches!(err, SnapshotError::VcpuRead(_)));
        assert_eq!(machine.resume_count(), 1);
    }

    #[test]
    fn test_paused_machine_guard() {
        let machine = TestMachine::default();

        {
            let _paused = PausedMachine::pause(&machine).unwrap();
            assert!(machine.paused.get());
        }
        assert!(!machine.paused.get());
        assert_eq!(machine.resume_count(), 1);

        let paused = PausedMachine::pause(&machine).unwrap();
        paused.resume().unwrap();
        assert_eq!(machine.resume_count(), 2);
    }
}
