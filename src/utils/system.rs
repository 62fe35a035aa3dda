// src/utils/system.rs: System functions

use anyhow::{anyhow, Result};
use log::warn;
use sysinfo::System;


/// Number of physical cores, used as the default scheduler capacity.
///
/// # Returns
///
/// usize physical cores, at least 1
pub fn detect_cores() -> usize {
    System::physical_core_count().unwrap_or(1).max(1)
}


/// Finds the amount of total and available RAM.
///
/// # Returns
///
/// Result<u64, u64> total ram, available ram (bytes)
pub fn detect_ram() -> Result<(u64, u64)> {
    let mut system = System::new();
    system.refresh_memory();
    let (total_ram, available_ram) = (system.total_memory(), system.available_memory());

    if total_ram == 0 || available_ram == 0 {
        return Err(anyhow!("Failed to detect valid RAM values"));
    }

    Ok((total_ram, available_ram))
}


/// Scheduler thread capacity: `requested` when given, otherwise the
/// physical core count.
///
/// # Arguments
///
/// * `requested` - Value of `--capacity`, if any.
/// * `physical_cores` - From detect_cores.
///
/// # Returns
///
/// usize capacity, at least 1
pub fn resolve_capacity(requested: Option<usize>, physical_cores: usize) -> usize {
    match requested {
        Some(capacity) => {
            if capacity > physical_cores {
                warn!(
                    "Capacity {} exceeds the {} physical cores; tasks may oversubscribe the CPU",
                    capacity, physical_cores
                );
            }
            capacity.max(1)
        }
        None => physical_cores.max(1),
    }
}
