//! Best-effort host description sent at registration.
//!
//! Every probe degrades to `None`/0 on failure.

use tokio::process::Command;
use tracing::debug;

use crate::broker::protocol::{GpuInfo, SystemInfo};

pub async fn collect() -> SystemInfo {
    SystemInfo {
        os: os_name().to_string(),
        cpu_arch: std::env::consts::ARCH.to_string(),
        total_memory_mb: total_memory_mb().await,
        gpu: gpu_info().await,
        client: env!("CARGO_PKG_NAME").to_string(),
        runtime: "rust".to_string(),
    }
}

fn os_name() -> &'static str {
    match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "Darwin",
        "windows" => "Windows",
        other => other,
    }
}

/// Trimmed stdout of a command that exited 0.
async fn try_run(program: &str, args: &[&str]) -> Option<String> {
    match Command::new(program).args(args).output().await {
        Ok(out) if out.status.success() => {
            let text = String::from_utf8_lossy(&out.stdout).trim().to_string();
            (!text.is_empty()).then_some(text)
        }
        Ok(out) => {
            debug!(program, status = %out.status, "Probe exited unsuccessfully");
            None
        }
        Err(e) => {
            debug!(program, error = %e, "Probe unavailable");
            None
        }
    }
}

async fn total_memory_mb() -> u64 {
    if cfg!(target_os = "linux") {
        return tokio::fs::read_to_string("/proc/meminfo")
            .await
            .ok()
            .and_then(|text| parse_meminfo(&text))
            .unwrap_or(0);
    }
    if cfg!(target_os = "macos") {
        return try_run("sysctl", &["-n", "hw.memsize"])
            .await
            .and_then(|s| s.parse::<u64>().ok())
            .map(|bytes| bytes / (1024 * 1024))
            .unwrap_or(0);
    }
    0
}

/// `MemTotal` from `/proc/meminfo`, in MiB.
fn parse_meminfo(text: &str) -> Option<u64> {
    let line = text.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}

async fn gpu_info() -> Option<GpuInfo> {
    if let Some(out) = try_run(
        "nvidia-smi",
        &[
            "--query-gpu=name,memory.total",
            "--format=csv,noheader,nounits",
        ],
    )
    .await
        && let Some(gpu) = parse_nvidia_smi(&out)
    {
        return Some(gpu);
    }
    if cfg!(target_os = "linux")
        && let Some(out) = try_run("lspci", &["-nn"]).await
    {
        return parse_lspci(&out);
    }
    None
}

/// First GPU from `nvidia-smi --format=csv,noheader,nounits`.
fn parse_nvidia_smi(out: &str) -> Option<GpuInfo> {
    let line = out.lines().next()?;
    let mut parts = line.split(',').map(str::trim);
    let name = parts.next()?;
    let mem = parts.next()?;
    Some(GpuInfo {
        vendor: "NVIDIA".to_string(),
        model: name.to_string(),
        vram_mb: mem.parse::<f64>().ok().map(|mb| mb as u64),
    })
}

/// First VGA/3D controller from `lspci -nn`.
fn parse_lspci(out: &str) -> Option<GpuInfo> {
    let line = out
        .lines()
        .find(|l| l.contains("VGA") || l.contains("3D"))?;
    let model = line
        .split_once("]: ")
        .map(|(_, rest)| rest)
        .unwrap_or(line)
        .trim()
        .to_string();
    let vendor = if model.contains("AMD") || model.contains("Advanced Micro Devices") {
        "AMD"
    } else if model.contains("Intel") {
        "Intel"
    } else if model.contains("NVIDIA") {
        "NVIDIA"
    } else {
        "Unknown"
    };
    Some(GpuInfo {
        vendor: vendor.to_string(),
        model,
        vram_mb: None,
    })
}

/// Human-readable summary for the `sysinfo` command.
pub fn describe(info: &SystemInfo) -> String {
    let gpu = match &info.gpu {
        Some(g) => match g.vram_mb {
            Some(vram) => format!("{} {} ({vram} MB VRAM)", g.vendor, g.model),
            None => format!("{} {}", g.vendor, g.model),
        },
        None => "None detected".to_string(),
    };
    format!(
        "OS: {}\nArchitecture: {}\nMemory: {} MB\nGPU: {}",
        info.os, info.cpu_arch, info.total_memory_mb, gpu
    )
}
