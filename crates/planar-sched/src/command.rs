//! Batch-submission command construction and resource sizing.

/// Bytes per memory-request unit (decimal gigabyte).
pub const BYTES_PER_UNIT: u64 = 1_000_000_000;

/// Parameters of one plane's submission command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitParams<'a> {
    /// Scheduler submission program, e.g. `bsub`.
    pub submit_command: &'a str,

    /// Number of cores to request.
    pub n_cores: u32,

    /// Job-name prefix; the plane index is appended.
    pub job_name: &'a str,

    /// Plane index.
    pub plane: u32,

    /// Memory request passed to `-M`.
    pub memory: u64,

    /// Extra scheduler arguments, inserted verbatim.
    ///
    /// This string is caller-supplied and not sanitized. It reaches the remote
    /// shell unchanged.
    pub extra_args: &'a str,

    /// Remote home directory holding `run_script.sh`.
    pub remote_home: &'a str,

    /// Remote path of the plane's descriptor.
    pub descriptor_path: &'a str,
}

/// Build the shell command that submits one plane.
///
/// ```text
/// bsub -n 8 -J plane3 -o out3.txt -e error3.log -M 4 \
///     "/home/u/run_script.sh '/data/plane3/ops.json' > log3.txt"
/// ```
pub fn build_submit_command(params: &SubmitParams<'_>) -> String {
    let plane = params.plane;
    let mut parts = vec![
        params.submit_command.to_string(),
        format!("-n {}", params.n_cores),
        format!("-J {}{}", params.job_name, plane),
        format!("-o out{plane}.txt"),
        format!("-e error{plane}.log"),
        format!("-M {}", params.memory),
    ];

    let extra = params.extra_args.trim();
    if !extra.is_empty() {
        parts.push(extra.to_string());
    }

    parts.push(format!(
        "\"{}/run_script.sh '{}' > log{}.txt\"",
        params.remote_home.trim_end_matches('/'),
        params.descriptor_path,
        plane
    ));

    parts.join(" ")
}

/// Memory request for a binary of `size_bytes`.
///
/// `ceil(size / 1 GB) * multiplier`, never less than one `multiplier`.
/// Saturates at `u64::MAX`.
pub fn memory_request(size_bytes: u64, multiplier: u32) -> u64 {
    size_bytes
        .div_ceil(BYTES_PER_UNIT)
        .max(1)
        .saturating_mul(u64::from(multiplier))
}
