// Copyright © 2026 The vmsnap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;

use clap::{Arg, ArgAction, ArgMatches, Command};
use log::info;
use thiserror::Error;
use vm_snapshot::State;
use vmm::config::{self, CpusConfig, DeviceConfig, VmConfig};
use vmm::Vm;

const DEFAULT_RUN_MS: u64 = 100;

#[derive(Error, Debug)]
enum Error {
    #[error("Failed to create VM: {0}")]
    VmCreate(#[source] vmm::Error),
    #[error("Failed to boot VM: {0}")]
    VmBoot(#[source] vmm::Error),
    #[error("Failed to pause VM: {0}")]
    VmPause(#[source] vmm::Error),
    #[error("Failed to snapshot VM: {0}")]
    VmSnapshot(#[source] vmm::Error),
    #[error("Failed to resume VM: {0}")]
    VmResume(#[source] vmm::Error),
    #[error("Failed to shut down VM: {0}")]
    VmShutdown(#[source] vmm::Error),
    #[error("Failed to create snapshot file {0:?}: {1}")]
    SnapshotFile(PathBuf, #[source] io::Error),
    #[error("Failed to save snapshot: {0}")]
    SnapshotSave(#[source] vmm::Error),
}

fn create_app() -> Command {
    Command::new("vmsnap")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Boot a virtual machine and capture a snapshot of its vCPU and device state.")
        .arg(
            Arg::new("cpus")
                .long("cpus")
                .help("Number of vCPUs to boot")
                .value_parser(clap::value_parser!(u8))
                .default_value(config::DEFAULT_VCPUS.to_string()),
        )
        .arg(
            Arg::new("device")
                .long("device")
                .help("Identifier of a device to plug, in bus order")
                .num_args(1)
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("device-latency-ms")
                .long("device-latency-ms")
                .help("Time each device takes to complete a request")
                .value_parser(clap::value_parser!(u64))
                .default_value(config::DEFAULT_DEVICE_LATENCY_MS.to_string()),
        )
        .arg(
            Arg::new("quiesce-timeout-ms")
                .long("quiesce-timeout-ms")
                .help("Maximum time to wait for one device to complete its outstanding requests")
                .value_parser(clap::value_parser!(u64))
                .default_value(config::DEFAULT_QUIESCE_TIMEOUT_MS.to_string()),
        )
        .arg(
            Arg::new("run-ms")
                .long("run-ms")
                .help("Time to let the VM run before taking the snapshot")
                .value_parser(clap::value_parser!(u64))
                .default_value(DEFAULT_RUN_MS.to_string()),
        )
        .arg(
            Arg::new("paused")
                .long("paused")
                .help("Pause the VM before taking the snapshot")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("snapshot")
                .long("snapshot")
                .help("File to write the snapshot to, or - for standard output")
                .num_args(1)
                .required(true),
        )
}

fn vm_config(matches: &ArgMatches) -> VmConfig {
    // These .unwrap()s cannot fail as there is a default value defined
    let boot_vcpus = *matches.get_one::<u8>("cpus").unwrap();
    let latency = Duration::from_millis(*matches.get_one::<u64>("device-latency-ms").unwrap());
    let quiesce_timeout =
        Duration::from_millis(*matches.get_one::<u64>("quiesce-timeout-ms").unwrap());

    let devices = matches
        .get_many::<String>("device")
        .map(|ids| {
            ids.map(|id| DeviceConfig {
                id: id.clone(),
                latency,
            })
            .collect()
        })
        .unwrap_or_default();

    VmConfig {
        cpus: CpusConfig { boot_vcpus },
        devices,
        quiesce_timeout,
    }
}

fn take_snapshot(vm: &Vm, pause: bool) -> Result<State, Error> {
    if pause {
        vm.pause().map_err(Error::VmPause)?;
    }

    let state = vm.snapshot().map_err(Error::VmSnapshot);

    if pause {
        vm.resume().map_err(Error::VmResume)?;
    }

    state
}

fn save_snapshot(state: &State, destination: &str) -> Result<(), Error> {
    if destination == "-" {
        return vmm::write_state(state, io::stdout().lock()).map_err(Error::SnapshotSave);
    }

    let path = PathBuf::from(destination);
    let file = File::create(&path).map_err(|e| Error::SnapshotFile(path.clone(), e))?;
    vmm::write_state(state, BufWriter::new(file)).map_err(Error::SnapshotSave)?;
    info!("Snapshot saved to {:?}", path);

    Ok(())
}

fn start_vm_and_snapshot(matches: &ArgMatches) -> Result<(), Error> {
    let vm_config = vm_config(matches);
    info!(
        "vCPUs: {}, devices: {:?}",
        vm_config.cpus.boot_vcpus,
        vm_config
            .devices
            .iter()
            .map(|d| d.id.as_str())
            .collect::<Vec<_>>()
    );

    let vm = Vm::new(&vm_config).map_err(Error::VmCreate)?;
    vm.boot().map_err(Error::VmBoot)?;

    thread::sleep(Duration::from_millis(
        *matches.get_one::<u64>("run-ms").unwrap(),
    ));

    let state = take_snapshot(&vm, matches.get_flag("paused"))?;
    vm.shutdown().map_err(Error::VmShutdown)?;

    // The snapshot flag is required.
    save_snapshot(&state, matches.get_one::<String>("snapshot").unwrap())
}

fn main() {
    env_logger::init();

    let matches = create_app().get_matches();

    if let Err(e) = start_vm_and_snapshot(&matches) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
