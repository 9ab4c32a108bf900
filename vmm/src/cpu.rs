// Copyright © 2026 The vmsnap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;
use std::{io, result};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vm_snapshot::VcpuState;

use crate::device_manager::{DeviceManagerError, IoBus, IoRequest};

/// Where the synthetic instruction stream starts.
const ENTRY_POINT: u64 = 0x10_0000;
/// A vCPU issues one I/O request every `IO_INTERVAL` instructions.
const IO_INTERVAL: u64 = 16;
/// Time slice for executing one instruction.
const VCPU_RUN_INTERVAL: Duration = Duration::from_micros(100);

#[derive(Debug, Error)]
pub enum Error {
    #[error("Error spawning vCPU thread: {0}")]
    VcpuSpawn(#[source] io::Error),

    #[error("Error joining vCPU threads")]
    ThreadCleanup,

    #[error("vCPUs have already been started")]
    VcpusAlreadyStarted,

    #[error("vCPUs are not running")]
    VcpusNotRunning,

    #[error("vCPU {0} is not running")]
    VcpuNotRunning(u8),

    #[error("vCPUs are not paused")]
    VcpusNotPaused,

    #[error("vCPU {0} has not acknowledged the pause")]
    VcpuPauseNotAcknowledged(u8),

    #[error("State of vCPU {0} is not readable")]
    VcpuStatePoisoned(u8),

    #[error("Error saving vCPU state: {0}")]
    VcpuSaveState(#[source] vm_snapshot::SnapshotError),

    #[error("Error issuing I/O request: {0}")]
    IoRequest(#[source] DeviceManagerError),
}
pub type Result<T> = result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StandardRegisters {
    pub rip: u64,
    pub rax: u64,
    pub rflags: u64,
}

/// vCPU state, as recorded in a snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CpuState {
    pub id: u8,
    pub regs: StandardRegisters,
    /// Instructions executed since boot.
    pub instructions: u64,
    /// I/O requests issued since boot.
    pub io_requests: u64,
}

pub struct Vcpu {
    state: CpuState,
    io_bus: Arc<IoBus>,
}

impl Vcpu {
    pub fn new(id: u8, io_bus: Arc<IoBus>) -> Self {
        Vcpu {
            state: CpuState {
                id,
                regs: StandardRegisters {
                    rip: ENTRY_POINT,
                    rax: u64::from(id),
                    rflags: 0x2,
                },
                ..Default::default()
            },
            io_bus,
        }
    }

    pub fn id(&self) -> u8 {
        self.state.id
    }

    pub fn state(&self) -> CpuState {
        self.state
    }

    /// Execute one instruction. Every `IO_INTERVAL` instructions this is an
    /// I/O instruction, which is routed to a device.
    pub fn run(&mut self) -> Result<()> {
        let regs = &mut self.state.regs;
        regs.rip = regs.rip.wrapping_add(1);
        regs.rax = regs
            .rax
            .wrapping_mul(6364136223846793005)
            .wrapping_add(u64::from(self.state.id) + 1);
        self.state.instructions += 1;

        if self.state.instructions % IO_INTERVAL == 0 && !self.io_bus.is_empty() {
            let slot = self.state.io_requests + u64::from(self.state.id);
            self.io_bus
                .dispatch(
                    slot,
                    IoRequest {
                        vcpu_id: self.state.id,
                        value: self.state.regs.rax,
                    },
                )
                .map_err(Error::IoRequest)?;
            self.state.io_requests += 1;
        }

        Ok(())
    }
}

struct VcpuThreadState {
    vcpu: Arc<Mutex<Vcpu>>,
    paused: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl VcpuThreadState {
    fn running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn join_thread(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.join().map_err(|_| Error::ThreadCleanup)?
        }

        Ok(())
    }

    fn unpark_thread(&self) {
        if let Some(handle) = self.handle.as_ref() {
            handle.thread().unpark()
        }
    }
}

pub struct CpuManager {
    boot_vcpus: u8,
    io_bus: Arc<IoBus>,
    vcpus_kill_signalled: Arc<AtomicBool>,
    vcpus_pause_signalled: Arc<AtomicBool>,
    /// Number of pause requests not matched by a resume yet.
    pause_count: usize,
    vcpu_states: Vec<VcpuThreadState>,
}

impl CpuManager {
    pub fn new(boot_vcpus: u8, io_bus: Arc<IoBus>) -> Arc<Mutex<CpuManager>> {
        Arc::new(Mutex::new(CpuManager {
            boot_vcpus,
            io_bus,
            vcpus_kill_signalled: Arc::new(AtomicBool::new(false)),
            vcpus_pause_signalled: Arc::new(AtomicBool::new(false)),
            pause_count: 0,
            vcpu_states: Vec::with_capacity(usize::from(boot_vcpus)),
        }))
    }

    pub fn boot_vcpus(&self) -> u8 {
        self.boot_vcpus
    }

    // Starts all the vCPUs that the VM is booting with. Blocks until all vCPUs are running.
    pub fn start_boot_vcpus(&mut self) -> Result<()> {
        if !self.vcpu_states.is_empty() {
            return Err(Error::VcpusAlreadyStarted);
        }

        let vcpu_thread_barrier = Arc::new(Barrier::new(usize::from(self.boot_vcpus) + 1));

        for cpu_id in 0..self.boot_vcpus {
            let vcpu = Arc::new(Mutex::new(Vcpu::new(cpu_id, self.io_bus.clone())));
            let paused = Arc::new(AtomicBool::new(false));

            let vcpu_thread_barrier = vcpu_thread_barrier.clone();
            let vcpu_kill_signalled = self.vcpus_kill_signalled.clone();
            let vcpu_pause_signalled = self.vcpus_pause_signalled.clone();
            let vcpu_paused = paused.clone();
            let thread_vcpu = vcpu.clone();

            let handle = thread::Builder::new()
                .name(format!("vcpu{cpu_id}"))
                .spawn(move || {
                    // Block until all CPUs are ready.
                    vcpu_thread_barrier.wait();

                    loop {
                        // We've been told to terminate
                        if vcpu_kill_signalled.load(Ordering::SeqCst) {
                            break;
                        }

                        // If we are being told to pause, we acknowledge it
                        // and park the thread until the pause boolean is
                        // toggled. The resume operation is responsible for
                        // toggling the boolean and unparking the thread.
                        // We loop here because park() could spuriously return.
                        if vcpu_pause_signalled.load(Ordering::SeqCst) {
                            vcpu_paused.store(true, Ordering::SeqCst);
                            while vcpu_pause_signalled.load(Ordering::SeqCst)
                                && !vcpu_kill_signalled.load(Ordering::SeqCst)
                            {
                                thread::park();
                            }
                            vcpu_paused.store(false, Ordering::SeqCst);
                            continue;
                        }

                        let result = thread_vcpu.lock().unwrap().run();
                        if let Err(e) = result {
                            error!("vCPU {} generated error: {}", cpu_id, e);
                            break;
                        }

                        thread::sleep(VCPU_RUN_INTERVAL);
                    }
                    debug!("vCPU {} thread exited", cpu_id);
                })
                .map_err(Error::VcpuSpawn)?;

            self.vcpu_states.push(VcpuThreadState {
                vcpu,
                paused,
                handle: Some(handle),
            });
        }

        // Unblock all CPU threads.
        vcpu_thread_barrier.wait();
        info!("Started {} vCPU(s)", self.boot_vcpus);
        Ok(())
    }

    /// Whether the vCPUs are paused and every one of them acknowledged it.
    pub fn paused(&self) -> bool {
        self.pause_count > 0
            && self
                .vcpu_states
                .iter()
                .all(|state| state.paused.load(Ordering::SeqCst))
    }

    // Wait for all the threads to acknowledge the pause before going further.
    fn wait_for_pause_ack(&self) -> Result<()> {
        for (cpu_id, state) in self.vcpu_states.iter().enumerate() {
            while !state.paused.load(Ordering::SeqCst) {
                if !state.running() {
                    return Err(Error::VcpuNotRunning(cpu_id as u8));
                }
                // To avoid a priority inversion with the vCPU thread
                thread::sleep(Duration::from_millis(1));
            }
        }
        Ok(())
    }

    fn wait_for_resume_ack(&self) {
        for state in self.vcpu_states.iter() {
            while state.paused.load(Ordering::SeqCst) && state.running() {
                state.unpark_thread();
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    fn release_vcpus(&self) {
        // Toggle the vCPUs pause boolean
        self.vcpus_pause_signalled.store(false, Ordering::SeqCst);

        // Unpark all the vCPU threads.
        // Once unparked, the next thing they will do is checking for the pause
        // boolean. Since it'll be set to false, they will exit their pause loop
        // and go back to executing instructions.
        for state in self.vcpu_states.iter() {
            state.unpark_thread();
        }
    }

    /// Pause all vCPUs.
    ///
    /// Pauses nest: only the first one stops the vCPUs, which then stay
    /// stopped until every pause has been matched by a resume.
    pub fn pause(&mut self, full: bool) -> Result<()> {
        if self.vcpu_states.is_empty() || self.vcpus_kill_signalled.load(Ordering::SeqCst) {
            return Err(Error::VcpusNotRunning);
        }

        if self.pause_count == 0 {
            // Tell the vCPUs to pause themselves next time they go through
            // their loop.
            self.vcpus_pause_signalled.store(true, Ordering::SeqCst);
        }
        self.pause_count += 1;

        if full {
            if let Err(e) = self.wait_for_pause_ack() {
                // Leave the vCPUs as they were before this call.
                self.pause_count -= 1;
                if self.pause_count == 0 {
                    self.release_vcpus();
                }
                return Err(e);
            }
        }

        debug!("vCPUs paused (depth {})", self.pause_count);
        Ok(())
    }

    /// Resume all vCPUs, once the last outstanding pause is released.
    pub fn resume(&mut self, full: bool) -> Result<()> {
        if self.pause_count == 0 {
            return Err(Error::VcpusNotPaused);
        }

        self.pause_count -= 1;
        if self.pause_count == 0 {
            self.release_vcpus();
            if full {
                self.wait_for_resume_ack();
            }
            debug!("vCPUs resumed");
        }

        Ok(())
    }

    /// Capture the state of all vCPUs, ordered by vCPU id.
    pub fn vcpu_states(&self) -> Result<Vec<VcpuState>> {
        if self.pause_count == 0 {
            return Err(Error::VcpusNotPaused);
        }

        let mut states = Vec::with_capacity(self.vcpu_states.len());
        for (cpu_id, state) in self.vcpu_states.iter().enumerate() {
            let cpu_id = cpu_id as u8;
            if !state.running() {
                return Err(Error::VcpuNotRunning(cpu_id));
            }
            if !state.paused.load(Ordering::SeqCst) {
                return Err(Error::VcpuPauseNotAcknowledged(cpu_id));
            }

            let vcpu = state
                .vcpu
                .lock()
                .map_err(|_| Error::VcpuStatePoisoned(cpu_id))?;
            states.push(VcpuState::new_from_state(&vcpu.state()).map_err(Error::VcpuSaveState)?);
        }

        Ok(states)
    }

    pub fn shutdown(&mut self) -> Result<()> {
        // Tell the vCPUs to stop themselves next time they go through the loop
        self.vcpus_kill_signalled.store(true, Ordering::SeqCst);

        // Release the paused vCPUs so they can see the kill signal.
        self.pause_count = 0;
        self.release_vcpus();

        for state in self.vcpu_states.iter_mut() {
            state.join_thread()?;
        }

        Ok(())
    }
}
