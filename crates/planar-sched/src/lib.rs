//! Planar job dispatch for remote batch clusters
//!
//! This crate submits one batch job per imaging plane to an LSF-style cluster
//! reachable over SSH. Each plane lives in its own `plane<N>` folder holding a
//! JSON descriptor (`ops.json`) and the plane's binary data.
//!
//! # Overview
//!
//! A dispatch run:
//! 1. **Discovery**: Lists the plane folders in natural order (`plane2` before `plane10`)
//! 2. **Connection**: Opens an SSH session, retrying transient failures
//! 3. **Bootstrap**: Uploads `run_script.sh` to the remote home
//! 4. **Transfer**: Mirrors each plane's files into the remote tree, once
//! 5. **Submission**: Sizes the memory request and submits one job per plane
//!
//! Running the same dispatch twice copies nothing the second time but
//! submits every plane again.
//!
//! # Path Translation
//!
//! | Local | Remote |
//! |-------|--------|
//! | `/mnt/lab/run1` (descriptor `save_path0`) | `/groups/lab` (`remote_root`) |
//! | `/mnt/lab/run1/suite2p` | `/groups/lab/suite2p` |
//! | `/mnt/lab/run1/suite2p/plane3` | `/groups/lab/suite2p/plane3` |
//!
//! Remote paths always use `/`, whatever the local platform.
//!
//! # Example
//!
//! ```ignore
//! use planar_sched::{send_jobs, DispatchConfig, SshConnector};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = DispatchConfig::load(Some("planar.yaml".as_ref()))?;
//!     let save_folder = std::path::Path::new("/mnt/lab/run1/suite2p");
//!     let report = send_jobs(&SshConnector::new(), &config, save_folder).await?;
//!
//!     for plane in &report.planes {
//!         println!("plane{}: {:?}", plane.index, plane.confirmation);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Testing
//!
//! [`MockConnector`] and [`MockSession`] simulate a remote host in memory,
//! including scripted connection failures and failed submissions.

pub mod command;
pub mod config;
pub mod connection;
pub mod descriptor;
pub mod dispatcher;
pub mod error;
pub mod path;
pub mod plane;
pub mod probe;
pub mod remote;
pub mod script;

// Re-exports
pub use command::{build_submit_command, memory_request, SubmitParams};
pub use config::DispatchConfig;
pub use connection::{
    ConnectFailure, ConnectState, ConnectionManager, Connector, HostTarget, RetryPolicy,
};
pub use descriptor::{keys, DescriptorValue, JobDescriptor};
pub use dispatcher::{
    send_jobs, send_jobs_with_progress, DispatchEvent, DispatchReport, Dispatcher, PlaneReport,
};
pub use error::{DispatchError, DispatchResult};
pub use path::{join_remote, unix_path, RemoteLayout};
pub use plane::{discover_planes, natural_cmp, PlaneDir};
pub use probe::remote_exists;
pub use remote::{
    CommandOutput, MockConnector, MockSession, MockSnapshot, RemoteSession, RemoteStat,
    SshConnector, SshSession,
};
pub use script::{render_script, write_script, SCRIPT_NAME};
