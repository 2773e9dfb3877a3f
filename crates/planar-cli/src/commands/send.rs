//! Send command implementation.
//!
//! Copies each plane of a save folder to the cluster and submits one job per
//! plane.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use planar_sched::{
    send_jobs_with_progress, DispatchConfig, DispatchEvent, PlaneReport, SshConnector,
};

/// Values given on the command line; each one set replaces the configured value.
#[derive(Debug, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub remote_root: Option<String>,
    pub local_root: Option<PathBuf>,
    pub n_cores: Option<u32>,
    pub env_name: Option<String>,
    pub mem_multiplier: Option<u32>,
    pub scheduler_args: Option<String>,
    pub submit_command: Option<String>,
    pub job_name: Option<String>,
}

impl Overrides {
    /// Apply the overrides on top of `config`.
    pub fn apply(self, mut config: DispatchConfig) -> DispatchConfig {
        if let Some(v) = self.host {
            config.host = v;
        }
        if let Some(v) = self.port {
            config.port = v;
        }
        if let Some(v) = self.username {
            config.username = v;
        }
        if let Some(v) = self.password {
            config.password = v;
        }
        if let Some(v) = self.remote_root {
            config.remote_root = v;
        }
        if let Some(v) = self.local_root {
            config.local_root = Some(v);
        }
        if let Some(v) = self.n_cores {
            config.n_cores = v;
        }
        if let Some(v) = self.env_name {
            config.env_name = v;
        }
        if let Some(v) = self.mem_multiplier {
            config.mem_request_multiplier = v;
        }
        if let Some(v) = self.scheduler_args {
            config.scheduler_args = v;
        }
        if let Some(v) = self.submit_command {
            config.submit_command = v;
        }
        if let Some(v) = self.job_name {
            config.job_name = v;
        }
        config
    }
}

/// Execute the send command.
pub async fn execute(
    save_folder: &Path,
    config_file: Option<&Path>,
    overrides: Overrides,
    known_hosts: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let config = overrides.apply(DispatchConfig::load(config_file)?);
    config.validate()?;
    tracing::debug!("Resolved configuration: {:?}", config);

    if !save_folder.is_dir() {
        anyhow::bail!("Save folder not found: {}", save_folder.display());
    }

    println!(
        "{} Sending {} to {}@{}:{}",
        style("→").cyan().bold(),
        style(save_folder.display()).green(),
        style(&config.username).yellow(),
        style(&config.host).yellow(),
        style(&config.remote_root).magenta()
    );

    let connector = match known_hosts {
        Some(path) => SshConnector::with_known_hosts(path),
        None => SshConnector::new(),
    };

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}")?);
    spinner.set_message(format!("Dispatching planes to {}...", config.host));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let result = send_jobs_with_progress(&connector, &config, save_folder, |event| match event {
        DispatchEvent::Connected { host, planes } => {
            spinner.set_message(format!("Connected to {host}, dispatching {planes} plane(s)..."));
        }
        DispatchEvent::PlaneStarted {
            index,
            position,
            total,
        } => {
            spinner.set_message(format!("[{position}/{total}] Dispatching plane{index}..."));
        }
        DispatchEvent::PlaneFinished(plane) => {
            if !json {
                spinner.println(plane_line(plane));
            }
        }
    })
    .await;
    spinner.finish_and_clear();
    let report = result.with_context(|| format!("Dispatch to {} failed", config.host))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!();
        println!(
            "{} Submitted {} job(s), copied {} plane(s)",
            style("✓").green().bold(),
            report.submitted(),
            report.copied()
        );
    }

    Ok(())
}

fn plane_line(plane: &PlaneReport) -> String {
    let transfer = if plane.copied {
        style("copied").green()
    } else {
        style("already on server").dim()
    };
    let mut line = format!(
        "  {} plane{:<3} {:>8.2} GB  -M {:<4} {}",
        style("✓").green().bold(),
        plane.index,
        plane.binary_size as f64 / 1e9,
        plane.memory,
        transfer
    );
    if let Some(confirmation) = &plane.confirmation {
        line.push_str(&format!("\n      {}", style(confirmation).dim()));
    }
    line
}
