//! Bootstrap script that runs one plane on the cluster.

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::error::DispatchResult;

/// File name of the bootstrap script, locally and in the remote home.
pub const SCRIPT_NAME: &str = "run_script.sh";

/// Default single-plane entry point; the descriptor path is appended.
pub const DEFAULT_ENTRY_POINT: &str = "python -m suite2p --single_plane --ops";

/// Render the bootstrap script.
///
/// The script activates the conda environment `env_name` and runs
/// `entry_point` with the script's own arguments.
pub fn render_script(env_name: &str, entry_point: &str) -> String {
    let mut script = String::new();

    script.push_str("#!/bin/bash\n");
    // Make conda usable from a non-interactive shell
    script.push_str("eval $(conda shell.bash hook)\n");
    script.push_str("conda init bash\n");
    script.push_str(&format!("source activate {env_name}\n"));
    script.push_str("echo \"Running pipeline on server\"\n");
    script.push_str(&format!("{entry_point} \"$@\"\n"));

    script
}

/// Write the rendered script into `dir`, creating it if needed.
pub async fn write_script(
    dir: &Path,
    env_name: &str,
    entry_point: &str,
) -> DispatchResult<PathBuf> {
    fs::create_dir_all(dir).await?;
    let path = dir.join(SCRIPT_NAME);
    fs::write(&path, render_script(env_name, entry_point)).await?;
    Ok(path)
}
