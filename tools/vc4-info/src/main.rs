use std::collections::BTreeMap;

use anyhow::{bail, Context};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use vc4_hal::mailbox::{Clock, Mailbox};
use vc4_hal::v3d::SystemInfo;
use vc4_hal::{BoardInfo, HalConfig, SystemAccess, SystemQuery};

#[derive(Parser, Debug)]
#[command(
    name = "vc4-info",
    about = "Report what the VideoCore IV hardware access layer sees on this machine."
)]
struct Args {
    /// Use the in-process emulator instead of the hardware (same as VC4_EMULATOR=1)
    #[arg(long, action = clap::ArgAction::SetTrue)]
    emulated: bool,

    /// Print the report as JSON
    #[arg(long, action = clap::ArgAction::SetTrue)]
    json: bool,

    /// Also try to allocate (and release) a buffer of this many bytes
    #[arg(long, value_name = "BYTES")]
    allocate: Option<u32>,
}

#[derive(Debug, Serialize)]
struct Report {
    emulated: bool,
    memory_backend: &'static str,
    execution_backend: &'static str,
    total_gpu_memory: u32,
    num_qpus: u32,
    qpu_clock_rate: u32,
    gpu_temperature: u32,
    total_vpm_memory: u32,
    /// Raw answers; absent when no backend could answer.
    queries: BTreeMap<&'static str, Option<u32>>,
    board: Option<BoardReport>,
    v3d: Option<V3dReport>,
    allocation: Option<AllocationReport>,
}

#[derive(Debug, Serialize)]
struct BoardReport {
    model: &'static str,
    processor: &'static str,
    revision: u32,
    warranty_void: bool,
    firmware_revision: Option<u32>,
    core_clock: Option<u32>,
    /// Offset from 1.2 V in microvolts.
    core_voltage: Option<u32>,
    throttled: Option<u32>,
}

#[derive(Debug, Serialize)]
struct V3dReport {
    technology_version: u32,
    revision: u32,
    slices: u32,
    qpus_per_slice: u32,
    tmus_per_slice: u32,
    semaphores: u32,
    vpm_bytes: u32,
    vpm_user_bytes: u32,
}

#[derive(Debug, Serialize)]
struct AllocationReport {
    size: u32,
    handle: u32,
    device_ptr: u32,
    released: bool,
}

fn query_key(query: SystemQuery) -> &'static str {
    match query {
        SystemQuery::CurrentQpuClockRateHz => "current_qpu_clock_rate_hz",
        SystemQuery::MaximumQpuClockRateHz => "maximum_qpu_clock_rate_hz",
        SystemQuery::CurrentArmClockRateHz => "current_arm_clock_rate_hz",
        SystemQuery::MaximumArmClockRateHz => "maximum_arm_clock_rate_hz",
        SystemQuery::QpuTemperatureMilliDegrees => "qpu_temperature_milli_degrees",
        SystemQuery::TotalArmMemoryBytes => "total_arm_memory_bytes",
        SystemQuery::TotalGpuMemoryBytes => "total_gpu_memory_bytes",
        SystemQuery::TotalVpmMemoryBytes => "total_vpm_memory_bytes",
        SystemQuery::NumQpus => "num_qpus",
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = if args.emulated {
        HalConfig::emulated()
    } else {
        HalConfig::from_env()
    };
    tracing::debug!(?config, "opening hardware access");
    let system = SystemAccess::new(config).context("initialise hardware access")?;

    let report = collect(&system, args.allocate)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_text(&report);
    }
    Ok(())
}

fn collect(system: &SystemAccess, allocate: Option<u32>) -> anyhow::Result<Report> {
    let queries = SystemQuery::ALL
        .into_iter()
        .map(|query| (query_key(query), system.query(query)))
        .collect();

    // The facade only opens the mailbox when it allocates or executes through it.
    let standalone;
    let mailbox = match system.mailbox() {
        Some(mailbox) => Some(mailbox.as_ref()),
        None if system.is_emulated() => None,
        None => {
            standalone = Mailbox::open()
                .map_err(|err| tracing::debug!(error = %err, "no mailbox for the board report"))
                .ok();
            standalone.as_ref()
        }
    };
    let board = match mailbox {
        Some(mailbox) => match mailbox.board_revision()? {
            Some(revision) => {
                let info = BoardInfo::decode(revision);
                Some(BoardReport {
                    model: info.model,
                    processor: info.processor,
                    revision: info.revision,
                    warranty_void: info.warranty_void,
                    firmware_revision: mailbox.firmware_revision()?,
                    core_clock: mailbox.clock_rate(Clock::Core)?,
                    core_voltage: mailbox.voltage(1)?,
                    throttled: mailbox.throttled()?,
                })
            }
            None => None,
        },
        None => None,
    };

    let v3d = system.v3d().map(|v3d| V3dReport {
        technology_version: v3d.technology_version(),
        revision: v3d.system_info(SystemInfo::V3dRevision),
        slices: v3d.system_info(SystemInfo::SliceCount),
        qpus_per_slice: v3d.system_info(SystemInfo::QpuPerSlice),
        tmus_per_slice: v3d.system_info(SystemInfo::TmuPerSlice),
        semaphores: v3d.system_info(SystemInfo::SemaphoreCount),
        vpm_bytes: v3d.system_info(SystemInfo::VpmMemorySize),
        vpm_user_bytes: v3d.system_info(SystemInfo::VpmUserMemorySize),
    });

    let allocation = match allocate {
        Some(size) => {
            let Some(buffer) = system
                .allocate_buffer(size, vc4_hal::PAGE_ALIGNMENT)
                .with_context(|| format!("allocate {size} bytes"))?
            else {
                bail!("the memory backend refused to allocate {size} bytes");
            };
            let handle = buffer.handle();
            let device_ptr = buffer.device_ptr().value();
            let released = system.deallocate_buffer(buffer)?;
            Some(AllocationReport {
                size,
                handle,
                device_ptr,
                released,
            })
        }
        None => None,
    };

    Ok(Report {
        emulated: system.is_emulated(),
        memory_backend: system.memory_backend().name(),
        execution_backend: system.execution_backend().name(),
        total_gpu_memory: system.total_gpu_memory(),
        num_qpus: system.num_qpus(),
        qpu_clock_rate: system.qpu_clock_rate(),
        gpu_temperature: system.gpu_temperature(),
        total_vpm_memory: system.total_vpm_memory(),
        queries,
        board,
        v3d,
        allocation,
    })
}

fn print_text(report: &Report) {
    println!(
        "backends:     memory={} execution={}{}",
        report.memory_backend,
        report.execution_backend,
        if report.emulated { " (emulated)" } else { "" }
    );
    if let Some(board) = &report.board {
        println!(
            "board:        Raspberry Pi {} ({}, revision {:#x}{})",
            board.model,
            board.processor,
            board.revision,
            if board.warranty_void { ", warranty void" } else { "" }
        );
        if let Some(firmware) = board.firmware_revision {
            println!("firmware:     {firmware}");
        }
    }
    println!("QPUs:         {}", report.num_qpus);
    println!("QPU clock:    {} MHz", report.qpu_clock_rate / 1_000_000);
    println!("temperature:  {:.1} C", f64::from(report.gpu_temperature) / 1000.0);
    println!("GPU memory:   {} MiB", report.total_gpu_memory >> 20);
    println!("VPM memory:   {} KiB", report.total_vpm_memory >> 10);
    if let Some(v3d) = &report.v3d {
        println!(
            "V3D:          v{} rev {}, {} slices x {} QPUs, {} TMUs/slice, {} semaphores",
            v3d.technology_version,
            v3d.revision,
            v3d.slices,
            v3d.qpus_per_slice,
            v3d.tmus_per_slice,
            v3d.semaphores
        );
    }
    if let Some(allocation) = &report.allocation {
        println!(
            "allocation:   {} bytes at {:#010x} (handle {}, released: {})",
            allocation.size, allocation.device_ptr, allocation.handle, allocation.released
        );
    }
}
