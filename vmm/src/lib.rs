// Copyright © 2026 The vmsnap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate log;

pub mod config;
pub mod cpu;
pub mod device_manager;
pub mod vm;

pub use vm::{write_state, Error, Result, Vm, VmState};
