//! Script command implementation.

use std::path::Path;

use anyhow::Result;
use console::style;

use planar_sched::script::DEFAULT_ENTRY_POINT;
use planar_sched::{render_script, write_script};

/// Execute the script command.
pub async fn execute(
    env_name: &str,
    entry_point: Option<&str>,
    output: Option<&Path>,
) -> Result<()> {
    let entry_point = entry_point.unwrap_or(DEFAULT_ENTRY_POINT);

    match output {
        Some(dir) => {
            let path = write_script(dir, env_name, entry_point).await?;
            println!(
                "{} Wrote {}",
                style("✓").green().bold(),
                style(path.display()).green()
            );
        }
        None => print!("{}", render_script(env_name, entry_point)),
    }

    Ok(())
}
