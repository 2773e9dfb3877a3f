//! Remote state probing.

use crate::error::{DispatchError, DispatchResult};
use crate::remote::RemoteSession;

/// Check whether `path` exists on the remote host.
///
/// Only a "not found" answer maps to `false`; any other failure is returned
/// as an error rather than being mistaken for absence.
pub async fn remote_exists<S>(session: &S, path: &str) -> DispatchResult<bool>
where
    S: RemoteSession + ?Sized,
{
    match session.stat(path).await {
        Ok(_) => Ok(true),
        Err(DispatchError::RemoteNotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}
