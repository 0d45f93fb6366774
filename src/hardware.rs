//! Local hardware detection used when a node advertises itself.

use serde::Serialize;
use sysinfo::System;

use crate::protocol::{AcceleratorType, HardwareCapabilities};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Probe the current machine. `accelerator` and `vram_gb` come from the
/// operator because there is no portable way to detect them.
pub fn detect(accelerator: AcceleratorType, vram_gb: Option<f64>) -> HardwareCapabilities {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu_all();
    let cpu_cores = (sys.cpus().len() as u32).max(1);

    HardwareCapabilities {
        cpu_cores,
        ram_gb: sys.total_memory() as f64 / BYTES_PER_GB,
        vram_gb,
        accelerator_type: accelerator,
        current_load: current_load(cpu_cores),
        available: true,
    }
}

/// One-minute load average divided by core count, clamped to [0, 1].
pub fn current_load(cpu_cores: u32) -> f64 {
    normalize_load(System::load_average().one, cpu_cores)
}

/// Point-in-time utilisation of the host.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SystemUsage {
    pub cpu_percent: f32,
    pub memory_percent: f64,
    pub load_average: f64,
}

/// Sample CPU and memory usage. CPU usage needs two readings, so this waits
/// for sysinfo's minimum update interval.
pub async fn usage() -> SystemUsage {
    let mut sys = System::new();
    sys.refresh_cpu_usage();
    tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let total = sys.total_memory();
    let memory_percent = match total {
        0 => 0.0,
        total => sys.used_memory() as f64 / total as f64 * 100.0,
    };
    SystemUsage {
        cpu_percent: sys.global_cpu_usage(),
        memory_percent,
        load_average: System::load_average().one,
    }
}

fn normalize_load(load: f64, cpu_cores: u32) -> f64 {
    if cpu_cores == 0 || !load.is_finite() {
        return 0.0;
    }
    (load / cpu_cores as f64).clamp(0.0, 1.0)
}
