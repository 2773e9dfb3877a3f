//! Command preview implementation.
//!
//! Prints the submission command a dispatch run would send for one plane,
//! without connecting anywhere.

use std::path::Path;

use anyhow::Result;

use planar_sched::{build_submit_command, memory_request, DispatchConfig, SubmitParams};

/// Execute the command preview.
pub fn execute(
    plane: u32,
    size: u64,
    ops_path: &str,
    home: &str,
    config_file: Option<&Path>,
) -> Result<()> {
    let config = DispatchConfig::load(config_file)?;

    let command = build_submit_command(&SubmitParams {
        submit_command: &config.submit_command,
        n_cores: config.n_cores,
        job_name: &config.job_name,
        plane,
        memory: memory_request(size, config.mem_request_multiplier),
        extra_args: &config.scheduler_args,
        remote_home: home,
        descriptor_path: ops_path,
    });

    println!("{command}");
    Ok(())
}
