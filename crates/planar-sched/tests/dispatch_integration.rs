//! Dispatch Integration Tests
//!
//! These tests drive full dispatch runs against the in-memory remote host.
//! They cover first-time copies, re-dispatch of already copied planes,
//! channel and raw-data variants, and the failure paths that must stop a run.

use std::path::{Path, PathBuf};

use planar_sched::dispatcher::{LOCAL_FAST_DISK, LOCAL_SAVE_PATH0};
use planar_sched::{
    keys, send_jobs, send_jobs_with_progress, DescriptorValue, DispatchConfig, DispatchError,
    DispatchEvent, JobDescriptor, MockConnector, MockSession,
};

const REMOTE_ROOT: &str = "/groups/lab";
const REMOTE_SAVE_FOLDER: &str = "/groups/lab/suite2p";

/// A local run folder with a `suite2p` save folder inside.
struct Run {
    dir: tempfile::TempDir,
}

impl Run {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn base(&self) -> PathBuf {
        self.dir.path().join("run1")
    }

    fn save_folder(&self) -> PathBuf {
        self.base().join("suite2p")
    }

    fn plane_dir(&self, index: u32) -> PathBuf {
        self.save_folder().join(format!("plane{index}"))
    }

    /// Add a plane with registered data of `size` bytes.
    async fn add_registered(&self, index: u32, size: usize, chan2: bool) {
        let dir = self.plane_dir(index);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("data.bin"), vec![1u8; size]).unwrap();

        let mut ops = self.descriptor(index);
        ops.set_path(keys::REG_FILE, dir.join("data.bin").to_string_lossy());
        if chan2 {
            std::fs::write(dir.join("data_chan2.bin"), vec![2u8; size / 2]).unwrap();
            ops.set_path(keys::REG_FILE_CHAN2, dir.join("data_chan2.bin").to_string_lossy());
        }
        ops.save().await.unwrap();
    }

    /// Add a plane with raw data of `size` bytes next to registered data.
    async fn add_raw(&self, index: u32, size: usize, chan2: bool) {
        let dir = self.plane_dir(index);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("data.bin"), vec![1u8; 8]).unwrap();
        std::fs::write(dir.join("data_raw.bin"), vec![3u8; size]).unwrap();

        let mut ops = self.descriptor(index);
        ops.set_path(keys::RAW_FILE, dir.join("data_raw.bin").to_string_lossy());
        if chan2 {
            std::fs::write(dir.join("data_raw_chan2.bin"), vec![4u8; size]).unwrap();
            ops.set_path(
                keys::RAW_FILE_CHAN2,
                dir.join("data_raw_chan2.bin").to_string_lossy(),
            );
        }
        ops.save().await.unwrap();
    }

    /// Add a registered plane whose descriptor has no `save_path0`.
    async fn add_without_save_path0(&self, index: u32, size: usize) {
        let dir = self.plane_dir(index);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("data.bin"), vec![1u8; size]).unwrap();

        let mut ops = JobDescriptor::new(dir.join("ops.json"));
        ops.set_path(keys::FAST_DISK, dir.to_string_lossy());
        ops.set_path(keys::REG_FILE, dir.join("data.bin").to_string_lossy());
        ops.save().await.unwrap();
    }

    fn descriptor(&self, index: u32) -> JobDescriptor {
        let dir = self.plane_dir(index);
        let mut ops = JobDescriptor::new(dir.join("ops.json"));
        ops.set_path(keys::FAST_DISK, dir.to_string_lossy());
        ops.set_path(keys::SAVE_PATH0, self.base().to_string_lossy());
        ops.insert("nchannels", 1_i64);
        ops.insert("tau", 1.25_f64);
        ops
    }

    fn config(&self) -> DispatchConfig {
        DispatchConfig {
            host: "login1.cluster.org".into(),
            username: "alice".into(),
            password: "secret".into(),
            remote_root: REMOTE_ROOT.into(),
            bootstrap_dir: Some(self.dir.path().join("bootstrap")),
            ..DispatchConfig::default()
        }
    }
}

fn cluster() -> MockSession {
    MockSession::with_home("/home/alice").with_dir(REMOTE_SAVE_FOLDER)
}

fn submissions(session: &MockSession) -> Vec<String> {
    session
        .snapshot()
        .commands
        .into_iter()
        .filter(|c| c.starts_with("bsub"))
        .collect()
}

fn remote_uploads(session: &MockSession) -> Vec<String> {
    session
        .snapshot()
        .uploads
        .into_iter()
        .map(|(_, remote)| remote)
        .collect()
}

async fn path_value(file: &Path, key: &str) -> Option<String> {
    JobDescriptor::load(file)
        .await
        .unwrap()
        .get(key)
        .and_then(DescriptorValue::as_path)
        .map(str::to_string)
}

#[tokio::test]
async fn test_first_dispatch_copies_and_submits() {
    let run = Run::new();
    run.add_registered(0, 1_500, false).await;
    let session = cluster();
    let connector = MockConnector::with_session(session.clone());

    let report = send_jobs(&connector, &run.config(), &run.save_folder())
        .await
        .unwrap();

    assert_eq!(report.submitted(), 1);
    assert_eq!(report.copied(), 1);
    assert_eq!(
        remote_uploads(&session),
        vec![
            "run_script.sh",
            "/groups/lab/suite2p/plane0/data.bin",
            "/groups/lab/suite2p/plane0/ops.json",
        ]
    );
    assert_eq!(
        submissions(&session),
        vec![
            "bsub -n 8 -J plane0 -o out0.txt -e error0.log -M 2 \
             \"/home/alice/run_script.sh '/groups/lab/suite2p/plane0/ops.json' > log0.txt\""
        ]
    );

    let snapshot = session.snapshot();
    assert!(snapshot.dirs.contains("/groups/lab/suite2p/plane0"));
    assert_eq!(
        snapshot.files.get("/groups/lab/suite2p/plane0/data.bin"),
        Some(&1_500)
    );
    assert_eq!(snapshot.closes, 1);
}

#[tokio::test]
async fn test_redispatch_skips_copy_but_resubmits() {
    let run = Run::new();
    run.add_registered(0, 100, false).await;
    run.add_registered(1, 100, false).await;
    let session = cluster();
    let connector = MockConnector::with_session(session.clone());
    let config = run.config();

    let first = send_jobs(&connector, &config, &run.save_folder())
        .await
        .unwrap();
    let uploads_after_first = session.snapshot().uploads.len();

    let second = send_jobs(&connector, &config, &run.save_folder())
        .await
        .unwrap();

    assert_eq!(first.copied(), 2);
    assert_eq!(second.copied(), 0);
    assert!(second.planes.iter().all(|p| p.uploaded.is_empty()));

    // Only the bootstrap script is uploaded again.
    let snapshot = session.snapshot();
    assert_eq!(snapshot.uploads.len(), uploads_after_first + 1);
    assert_eq!(
        snapshot.uploads.last().map(|(_, remote)| remote.as_str()),
        Some("run_script.sh")
    );

    assert_eq!(submissions(&session).len(), 4);
    assert_eq!(snapshot.closes, 2);
    assert_eq!(
        second.planes[1].confirmation.as_deref(),
        Some("Job <1003> is submitted to default queue <normal>.")
    );
}

#[tokio::test]
async fn test_descriptor_is_rewritten_for_the_cluster() {
    let run = Run::new();
    run.add_registered(3, 10, true).await;
    let session = cluster();

    send_jobs(
        &MockConnector::with_session(session.clone()),
        &run.config(),
        &run.save_folder(),
    )
    .await
    .unwrap();

    let file = run.plane_dir(3).join("ops.json");
    let remote = "/groups/lab/suite2p/plane3";
    assert_eq!(path_value(&file, keys::SAVE_PATH0).await.as_deref(), Some(REMOTE_ROOT));
    assert_eq!(path_value(&file, keys::SAVE_FOLDER).await.as_deref(), Some("suite2p"));
    assert_eq!(path_value(&file, keys::SAVE_PATH).await.as_deref(), Some(remote));
    assert_eq!(path_value(&file, keys::FAST_DISK).await.as_deref(), Some(remote));
    assert_eq!(
        path_value(&file, keys::OPS_PATH).await.as_deref(),
        Some("/groups/lab/suite2p/plane3/ops.json")
    );
    assert_eq!(
        path_value(&file, keys::REG_FILE).await.as_deref(),
        Some("/groups/lab/suite2p/plane3/data.bin")
    );
    assert_eq!(
        path_value(&file, keys::REG_FILE_CHAN2).await.as_deref(),
        Some("/groups/lab/suite2p/plane3/data_chan2.bin")
    );

    // Untouched keys survive.
    let ops = JobDescriptor::load(&file).await.unwrap();
    assert_eq!(ops.get("nchannels"), Some(&DescriptorValue::Int(1)));
    assert_eq!(ops.get("tau"), Some(&DescriptorValue::Float(1.25)));

    for (_, value) in ops.entries() {
        if let DescriptorValue::Path(path) = value {
            assert!(!path.contains('\\'), "backslash in {path}");
        }
    }
}

#[tokio::test]
async fn test_uploaded_descriptor_has_only_cluster_paths() {
    let run = Run::new();
    run.add_raw(0, 32, true).await;
    let session = cluster();

    send_jobs(
        &MockConnector::with_session(session.clone()),
        &run.config(),
        &run.save_folder(),
    )
    .await
    .unwrap();

    let (local, remote) = session
        .snapshot()
        .uploads
        .into_iter()
        .find(|(_, remote)| remote.ends_with("/ops.json"))
        .unwrap();
    assert_eq!(remote, "/groups/lab/suite2p/plane0/ops.json");

    let ops = JobDescriptor::load(&local).await.unwrap();
    for (key, value) in ops.entries() {
        if let DescriptorValue::Path(path) = value {
            assert!(path.starts_with(REMOTE_ROOT), "{key} = {path} is not on the cluster");
        }
    }

    // The local originals are kept as plain strings for the next dispatch.
    let plane_dir = run.plane_dir(0).to_string_lossy().into_owned();
    let base = run.base().to_string_lossy().into_owned();
    assert_eq!(ops.get(LOCAL_FAST_DISK), Some(&DescriptorValue::Str(plane_dir)));
    assert_eq!(ops.get(LOCAL_SAVE_PATH0), Some(&DescriptorValue::Str(base)));
}

#[tokio::test]
async fn test_local_root_falls_back_to_config() {
    let run = Run::new();
    run.add_without_save_path0(0, 16).await;
    let session = cluster();
    let config = DispatchConfig {
        local_root: Some(run.base()),
        ..run.config()
    };

    let report = send_jobs(
        &MockConnector::with_session(session.clone()),
        &config,
        &run.save_folder(),
    )
    .await
    .unwrap();

    assert_eq!(report.planes[0].remote_dir, "/groups/lab/suite2p/plane0");
    assert!(session.snapshot().dirs.contains("/groups/lab/suite2p/plane0"));

    let file = run.plane_dir(0).join("ops.json");
    assert_eq!(path_value(&file, keys::SAVE_PATH0).await.as_deref(), Some(REMOTE_ROOT));
}

#[tokio::test]
async fn test_missing_local_root_is_reported() {
    let run = Run::new();
    run.add_without_save_path0(0, 16).await;
    let session = cluster();

    let err = send_jobs(
        &MockConnector::with_session(session.clone()),
        &run.config(),
        &run.save_folder(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, DispatchError::MissingKey { ref key, .. } if key == "save_path0"));
    let snapshot = session.snapshot();
    assert!(!snapshot.dirs.contains("/groups/lab/suite2p/plane0"));
    assert!(submissions(&session).is_empty());
    assert_eq!(snapshot.closes, 1);
}

#[tokio::test]
async fn test_progress_reports_each_plane_as_it_goes() {
    let run = Run::new();
    for index in [10, 2] {
        run.add_registered(index, 16, false).await;
    }
    let session = cluster();
    let mut events = Vec::new();

    send_jobs_with_progress(
        &MockConnector::with_session(session.clone()),
        &run.config(),
        &run.save_folder(),
        |event| {
            events.push(match event {
                DispatchEvent::Connected { host, planes } => format!("connected {host} {planes}"),
                DispatchEvent::PlaneStarted {
                    index,
                    position,
                    total,
                } => format!("start plane{index} {position}/{total}"),
                DispatchEvent::PlaneFinished(plane) => {
                    format!("done plane{index} copied={}", plane.copied, index = plane.index)
                }
            })
        },
    )
    .await
    .unwrap();

    assert_eq!(
        events,
        vec![
            "connected login1.cluster.org 2",
            "start plane2 1/2",
            "done plane2 copied=true",
            "start plane10 2/2",
            "done plane10 copied=true",
        ]
    );
}

#[tokio::test]
async fn test_raw_data_replaces_registered_transfer() {
    let run = Run::new();
    run.add_raw(0, 64, true).await;
    let session = cluster();

    let report = send_jobs(
        &MockConnector::with_session(session.clone()),
        &run.config(),
        &run.save_folder(),
    )
    .await
    .unwrap();

    let uploads = remote_uploads(&session);
    assert!(uploads.contains(&"/groups/lab/suite2p/plane0/data_raw.bin".to_string()));
    assert!(uploads.contains(&"/groups/lab/suite2p/plane0/data_chan2_raw.bin".to_string()));
    assert!(!uploads.contains(&"/groups/lab/suite2p/plane0/data.bin".to_string()));
    assert_eq!(report.planes[0].binary_size, 64);

    let file = run.plane_dir(0).join("ops.json");
    assert_eq!(
        path_value(&file, keys::RAW_FILE_CHAN2).await.as_deref(),
        Some("/groups/lab/suite2p/plane0/data_chan2_raw.bin")
    );
}

#[tokio::test]
async fn test_planes_submitted_in_natural_order() {
    let run = Run::new();
    for index in [10, 2, 1] {
        run.add_registered(index, 16, false).await;
    }
    let session = cluster();

    let report = send_jobs(
        &MockConnector::with_session(session.clone()),
        &run.config(),
        &run.save_folder(),
    )
    .await
    .unwrap();

    let order: Vec<u32> = report.planes.iter().map(|p| p.index).collect();
    assert_eq!(order, vec![1, 2, 10]);

    let jobs: Vec<String> = submissions(&session)
        .iter()
        .map(|c| c.split_whitespace().nth(4).unwrap_or_default().to_string())
        .collect();
    assert_eq!(jobs, vec!["plane1", "plane2", "plane10"]);
}

#[tokio::test]
async fn test_scheduler_args_and_custom_submitter() {
    let run = Run::new();
    run.add_registered(0, 16, false).await;
    let session = cluster();
    let config = DispatchConfig {
        n_cores: 4,
        job_name: "s2p".into(),
        mem_request_multiplier: 3,
        scheduler_args: "-q short".into(),
        submit_command: "bsub".into(),
        ..run.config()
    };

    send_jobs(
        &MockConnector::with_session(session.clone()),
        &config,
        &run.save_folder(),
    )
    .await
    .unwrap();

    assert_eq!(
        submissions(&session),
        vec![
            "bsub -n 4 -J s2p0 -o out0.txt -e error0.log -M 3 -q short \
             \"/home/alice/run_script.sh '/groups/lab/suite2p/plane0/ops.json' > log0.txt\""
        ]
    );
}

#[tokio::test]
async fn test_malformed_plane_folder_fails_before_connecting() {
    let run = Run::new();
    run.add_registered(0, 16, false).await;
    std::fs::create_dir_all(run.save_folder().join("combined")).unwrap();
    let session = cluster();
    let connector = MockConnector::with_session(session.clone());

    let err = send_jobs(&connector, &run.config(), &run.save_folder())
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::InvalidPlaneFolder(ref name) if name == "combined"));
    assert_eq!(connector.attempts(), 0);
    assert!(session.snapshot().commands.is_empty());
}

#[tokio::test]
async fn test_submit_failure_stops_run_and_closes_once() {
    let run = Run::new();
    run.add_registered(0, 16, false).await;
    run.add_registered(1, 16, false).await;
    let session = cluster().fail_submit("Request aborted by esub");

    let err = send_jobs(
        &MockConnector::with_session(session.clone()),
        &run.config(),
        &run.save_folder(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, DispatchError::SubmitFailed { plane: 0, .. }));
    let snapshot = session.snapshot();
    assert_eq!(snapshot.closes, 1);
    assert!(!snapshot.dirs.contains("/groups/lab/suite2p/plane1"));
}

#[tokio::test]
async fn test_stat_failure_is_not_treated_as_absent() {
    let run = Run::new();
    run.add_registered(0, 16, false).await;
    let session = cluster().fail_stat("permission denied");

    let err = send_jobs(
        &MockConnector::with_session(session.clone()),
        &run.config(),
        &run.save_folder(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, DispatchError::Ssh(_)));
    assert!(!session.snapshot().dirs.contains("/groups/lab/suite2p/plane0"));
    assert_eq!(session.snapshot().closes, 1);
}

#[tokio::test]
async fn test_auth_failure_makes_one_attempt() {
    let run = Run::new();
    run.add_registered(0, 16, false).await;
    let connector = MockConnector::with_session(cluster()).fail_auth();

    let err = send_jobs(&connector, &run.config(), &run.save_folder())
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::AuthenticationFailed { .. }));
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test]
async fn test_save_folder_outside_root_is_rejected() {
    let run = Run::new();
    run.add_registered(0, 16, false).await;
    let mut ops = JobDescriptor::load(run.plane_dir(0).join("ops.json"))
        .await
        .unwrap();
    ops.set_path(keys::SAVE_PATH0, "/somewhere/else");
    ops.save().await.unwrap();
    let session = cluster();

    let err = send_jobs(
        &MockConnector::with_session(session.clone()),
        &run.config(),
        &run.save_folder(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, DispatchError::PathOutsideRoot { .. }));
    assert!(remote_uploads(&session).iter().all(|r| r == "run_script.sh"));
}
