//! Check command: show the effective configuration and start a unit once.

use std::sync::Arc;
use std::time::Instant;

use cellrun_core::{ExecutionHost, HostConfig};

use crate::UnitOptions;
use crate::colors;

pub async fn execute(config: &HostConfig, unit: &UnitOptions, json: bool) -> anyhow::Result<()> {
    let spawner = unit.spawner()?;
    let worker = spawner.describe();
    let host = ExecutionHost::new(Arc::clone(&spawner), config.clone());

    let start = Instant::now();
    host.initialize().await?;
    let startup = start.elapsed();
    host.shutdown();

    if json {
        let report = serde_json::json!({
            "config": config,
            "worker": worker,
            "strategy": host.strategy(),
            "startup_ms": startup.as_millis() as u64,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}Configuration{}", colors::BOLD, colors::RESET);
    println!("{}", "─".repeat(50));
    println!("  init_timeout_ms       {}", config.init_timeout_ms);
    println!("  execution_timeout_ms  {}", config.execution_timeout_ms);
    println!("  watchdog_ms           {}", config.watchdog_ms);
    println!("  fallback_grace_ms     {}", config.fallback_grace_ms);
    println!("  interrupt_mode        {:?}", config.interrupt_mode);
    println!();
    println!("  worker                {}", worker);
    println!("  interrupts            {}", host.strategy());
    println!(
        "\n{}Unit ready{} in {:.2}s",
        colors::GREEN,
        colors::RESET,
        startup.as_secs_f64()
    );
    Ok(())
}
