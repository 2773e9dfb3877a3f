//! Per-plane dispatch to a remote batch cluster.
//!
//! For every plane folder, in natural order, the dispatcher:
//!
//! 1. loads the plane's descriptor and translates its paths to the cluster,
//! 2. creates the remote working directory unless it already exists,
//! 3. uploads the binaries and the rewritten descriptor (first time only),
//! 4. sizes the memory request from the local binary and submits a job.
//!
//! A plane whose remote directory already exists is resubmitted without
//! copying anything. The check is per directory, so a directory left behind
//! by an interrupted copy counts as complete.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::command::{build_submit_command, memory_request, SubmitParams};
use crate::config::DispatchConfig;
use crate::connection::{ConnectionManager, Connector};
use crate::descriptor::{keys, DescriptorValue, JobDescriptor};
use crate::error::{DispatchError, DispatchResult};
use crate::path::{join_remote, RemoteLayout};
use crate::plane::{discover_planes, PlaneDir, DESCRIPTOR_FILE};
use crate::probe::remote_exists;
use crate::remote::{CommandOutput, RemoteSession};
use crate::script::{write_script, SCRIPT_NAME};

/// Descriptor key remembering the local staging directory once `fast_disk`
/// points at the cluster.
pub const LOCAL_FAST_DISK: &str = "local_fast_disk";

/// Descriptor key remembering the local base path once `save_path0` points
/// at the cluster.
pub const LOCAL_SAVE_PATH0: &str = "local_save_path0";

/// Binary file names: (local name, remote name).
const REG_BIN: (&str, &str) = ("data.bin", "data.bin");
const REG_CHAN2_BIN: (&str, &str) = ("data_chan2.bin", "data_chan2.bin");
const RAW_BIN: (&str, &str) = ("data_raw.bin", "data_raw.bin");
const RAW_CHAN2_BIN: (&str, &str) = ("data_raw_chan2.bin", "data_chan2_raw.bin");

/// Outcome of dispatching one plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaneReport {
    /// Plane index.
    pub index: u32,

    /// Remote working directory.
    pub remote_dir: String,

    /// Remote descriptor path passed to the job.
    pub descriptor_path: String,

    /// Whether files were copied in this run.
    pub copied: bool,

    /// Remote paths uploaded in this run.
    pub uploaded: Vec<String>,

    /// Size of the primary binary in bytes.
    pub binary_size: u64,

    /// Memory requested from the scheduler.
    pub memory: u64,

    /// Submission command as sent.
    pub command: String,

    /// First line the scheduler printed, usually the job id.
    pub confirmation: Option<String>,
}

/// Progress notifications emitted while a dispatch runs.
#[derive(Debug, Clone, Copy)]
pub enum DispatchEvent<'r> {
    /// The session is open; `planes` plane folders will be dispatched.
    Connected { host: &'r str, planes: usize },

    /// Plane `index` is next, the `position`-th of `total` (1-based).
    PlaneStarted {
        index: u32,
        position: usize,
        total: usize,
    },

    /// A plane was copied if needed and its job submitted.
    PlaneFinished(&'r PlaneReport),
}

/// Outcome of a whole dispatch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Per-plane results in dispatch order.
    pub planes: Vec<PlaneReport>,
}

impl DispatchReport {
    /// Number of planes whose data was copied in this run.
    pub fn copied(&self) -> usize {
        self.planes.iter().filter(|p| p.copied).count()
    }

    /// Number of jobs submitted.
    pub fn submitted(&self) -> usize {
        self.planes.len()
    }
}

/// Drives the per-plane protocol over one open session.
pub struct Dispatcher<'a, S: RemoteSession + ?Sized> {
    session: &'a S,
    config: &'a DispatchConfig,
}

impl<'a, S: RemoteSession + ?Sized> Dispatcher<'a, S> {
    /// Create a dispatcher on an open session.
    pub fn new(session: &'a S, config: &'a DispatchConfig) -> Self {
        Self { session, config }
    }

    /// Stage the bootstrap script and dispatch every plane in order.
    pub async fn run(
        &self,
        save_folder: &Path,
        planes: &[PlaneDir],
    ) -> DispatchResult<DispatchReport> {
        self.run_with_progress(save_folder, planes, |_| {}).await
    }

    /// Like [`run`](Self::run), reporting each plane as it starts and finishes.
    pub async fn run_with_progress<F>(
        &self,
        save_folder: &Path,
        planes: &[PlaneDir],
        mut progress: F,
    ) -> DispatchResult<DispatchReport>
    where
        F: FnMut(DispatchEvent<'_>),
    {
        self.stage_bootstrap().await?;

        let mut report = DispatchReport::default();
        for (i, plane) in planes.iter().enumerate() {
            progress(DispatchEvent::PlaneStarted {
                index: plane.index,
                position: i + 1,
                total: planes.len(),
            });
            let done = self.dispatch_plane(save_folder, plane).await?;
            progress(DispatchEvent::PlaneFinished(&done));
            report.planes.push(done);
        }
        Ok(report)
    }

    /// Write the bootstrap script locally and upload it to the remote home.
    pub async fn stage_bootstrap(&self) -> DispatchResult<PathBuf> {
        let script = write_script(
            &self.config.bootstrap_dir(),
            &self.config.env_name,
            &self.config.entry_point,
        )
        .await?;

        self.exec_lenient("chmod 777 ~/").await?;
        self.session.upload(&script, SCRIPT_NAME).await?;
        self.exec_lenient(&format!("chmod 777 {SCRIPT_NAME}")).await?;

        tracing::info!("Staged {} on the server", SCRIPT_NAME);
        Ok(script)
    }

    /// Dispatch one plane.
    pub async fn dispatch_plane(
        &self,
        save_folder: &Path,
        plane: &PlaneDir,
    ) -> DispatchResult<PlaneReport> {
        tracing::info!(">>>>>>>>>> PLANE {} <<<<<<<<<<", plane.index);

        // Everything that can fail on local input is checked before touching the remote.
        let mut ops = JobDescriptor::load(plane.descriptor_path()).await?;
        let local_stage = match ops.path(LOCAL_FAST_DISK)? {
            Some(path) => path,
            None => ops.require_path(keys::FAST_DISK)?,
        };
        let local_root = self.local_root(&ops)?;
        let layout = RemoteLayout::translate(&local_root, &self.config.remote_root, save_folder)?;
        let save_path = layout.plane_dir(plane.index);
        let descriptor_path = join_remote(&save_path, DESCRIPTOR_FILE);

        tracing::info!("save path on server: {}", layout.remote_base_path);

        let copy = if remote_exists(self.session, &save_path).await? {
            tracing::info!("{} already exists, skipping copy", save_path);
            false
        } else {
            tracing::info!("copying files to {}", save_path);
            self.session.mkdir(&save_path).await?;
            true
        };

        // Local bookkeeping is stored as plain strings; every path value in the
        // uploaded descriptor is a cluster path.
        if !ops.contains(LOCAL_FAST_DISK) {
            let stage = local_stage.to_string_lossy().into_owned();
            ops.insert(LOCAL_FAST_DISK, DescriptorValue::Str(stage));
        }
        if !ops.contains(LOCAL_SAVE_PATH0) {
            let root = local_root.to_string_lossy().into_owned();
            ops.insert(LOCAL_SAVE_PATH0, DescriptorValue::Str(root));
        }

        ops.set_path(keys::SAVE_PATH0, layout.remote_base_path.clone());
        ops.insert(
            keys::SAVE_FOLDER,
            DescriptorValue::Str(layout.remote_folder_name.clone()),
        );
        ops.set_path(keys::SAVE_PATH, save_path.clone());
        ops.set_path(keys::FAST_DISK, save_path.clone());
        ops.set_path(keys::OPS_PATH, descriptor_path.clone());
        ops.set_path(keys::REG_FILE, join_remote(&save_path, REG_BIN.1));

        let mut transfers: Vec<(PathBuf, String)> = Vec::new();
        let sizing_file;
        if ops.has_raw_data() {
            let raw_file = join_remote(&save_path, RAW_BIN.1);
            ops.set_path(keys::RAW_FILE, raw_file.clone());
            transfers.push((local_stage.join(RAW_BIN.0), raw_file));

            if ops.has_raw_chan2() {
                let raw_chan2 = join_remote(&save_path, RAW_CHAN2_BIN.1);
                ops.set_path(keys::RAW_FILE_CHAN2, raw_chan2.clone());
                transfers.push((local_stage.join(RAW_CHAN2_BIN.0), raw_chan2));
            }
            sizing_file = local_stage.join(RAW_BIN.0);
        } else {
            transfers.push((
                local_stage.join(REG_BIN.0),
                join_remote(&save_path, REG_BIN.1),
            ));

            if ops.has_reg_chan2() {
                let reg_chan2 = join_remote(&save_path, REG_CHAN2_BIN.1);
                ops.set_path(keys::REG_FILE_CHAN2, reg_chan2.clone());
                transfers.push((local_stage.join(REG_CHAN2_BIN.0), reg_chan2));
            }
            sizing_file = local_stage.join(REG_BIN.0);
        }

        let mut uploaded = Vec::new();
        if copy {
            for (local, remote) in &transfers {
                let bytes = self.session.upload(local, remote).await?;
                tracing::info!("copied {} ({} bytes)", remote, bytes);
                uploaded.push(remote.clone());
            }
        }

        ops.save().await?;
        if copy {
            tracing::info!("copying ops");
            self.session.upload(ops.file(), &descriptor_path).await?;
            uploaded.push(descriptor_path.clone());
        }

        let binary_size = tokio::fs::metadata(&sizing_file).await?.len();
        let memory = memory_request(binary_size, self.config.mem_request_multiplier);
        tracing::info!("Binary size: {:.2} GB", binary_size as f64 / 1e9);

        let remote_home = self.remote_home().await?;
        let command = build_submit_command(&SubmitParams {
            submit_command: &self.config.submit_command,
            n_cores: self.config.n_cores,
            job_name: &self.config.job_name,
            plane: plane.index,
            memory,
            extra_args: &self.config.scheduler_args,
            remote_home: &remote_home,
            descriptor_path: &descriptor_path,
        });

        let output = self.exec(&command).await?;
        if !output.success() {
            return Err(DispatchError::SubmitFailed {
                plane: plane.index,
                message: output.stderr.trim().to_string(),
            });
        }
        let confirmation = output.first_line().map(str::to_string);
        match &confirmation {
            Some(line) => tracing::info!("{}", line),
            None => tracing::warn!("Scheduler printed nothing for plane {}", plane.index),
        }

        Ok(PlaneReport {
            index: plane.index,
            remote_dir: save_path,
            descriptor_path,
            copied: copy,
            uploaded,
            binary_size,
            memory,
            command,
            confirmation,
        })
    }

    fn local_root(&self, ops: &JobDescriptor) -> DispatchResult<PathBuf> {
        if let Some(root) = ops.path(LOCAL_SAVE_PATH0)? {
            return Ok(root);
        }
        if let Some(root) = ops.path(keys::SAVE_PATH0)? {
            return Ok(root);
        }
        self.config.local_root.clone().ok_or_else(|| DispatchError::MissingKey {
            path: ops.file().display().to_string(),
            key: keys::SAVE_PATH0.to_string(),
        })
    }

    async fn remote_home(&self) -> DispatchResult<String> {
        let command = "echo $HOME";
        let output = self.exec(command).await?;
        match output.first_line() {
            Some(home) if output.success() => Ok(home.to_string()),
            _ => Err(DispatchError::RemoteCommand {
                command: command.to_string(),
                message: format!("could not read remote home: {}", output.stderr.trim()),
            }),
        }
    }

    async fn exec(&self, command: &str) -> DispatchResult<CommandOutput> {
        tracing::debug!("exec: {}", command);
        self.session.exec(command).await
    }

    async fn exec_lenient(&self, command: &str) -> DispatchResult<()> {
        let output = self.exec(command).await?;
        if !output.success() {
            tracing::warn!(
                "`{}` exited with status {}: {}",
                command,
                output.exit_status,
                output.stderr.trim()
            );
        }
        Ok(())
    }
}

/// Connect, dispatch every plane under `save_folder`, and disconnect.
///
/// Plane folders are discovered before connecting, so a malformed folder name
/// fails the run without any remote I/O. The session is closed exactly once,
/// whether or not dispatch succeeds.
pub async fn send_jobs<C: Connector>(
    connector: &C,
    config: &DispatchConfig,
    save_folder: &Path,
) -> DispatchResult<DispatchReport> {
    send_jobs_with_progress(connector, config, save_folder, |_| {}).await
}

/// [`send_jobs`], calling `progress` once connected and around every plane.
pub async fn send_jobs_with_progress<C, F>(
    connector: &C,
    config: &DispatchConfig,
    save_folder: &Path,
    mut progress: F,
) -> DispatchResult<DispatchReport>
where
    C: Connector,
    F: FnMut(DispatchEvent<'_>),
{
    config.validate()?;
    let planes = discover_planes(save_folder).await?;
    tracing::info!(
        "Found {} plane(s) in {}",
        planes.len(),
        save_folder.display()
    );

    let manager = ConnectionManager::new(config.retry_policy());
    let session = manager.connect(connector, &config.host_target()).await?;
    progress(DispatchEvent::Connected {
        host: &config.host,
        planes: planes.len(),
    });

    let result = Dispatcher::new(&session, config)
        .run_with_progress(save_folder, &planes, &mut progress)
        .await;

    tracing::info!("Command done, closing SSH connection");
    let closed = session.close().await;

    let report = result?;
    closed?;
    Ok(report)
}
