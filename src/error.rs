use std::path::PathBuf;

use thiserror::Error;

/// Failures that can occur before the request loop is entered.
///
/// Every variant here maps to the process exiting with status `-1`.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("usage: sdcardfs [-l] [-f] <backing-path> <uid> <gid>")]
    Usage,

    #[error("uid and gid must both be greater than zero")]
    ZeroId,

    #[error("backing path {0:?} does not exist or is not a directory")]
    BadBackingPath(PathBuf),

    #[error("mount failed: {0}")]
    Mount(#[source] std::io::Error),

    #[error("setgid({gid}) failed: {source}")]
    SetGid { gid: u32, source: std::io::Error },

    #[error("setuid({uid}) failed: {source}")]
    SetUid { uid: u32, source: std::io::Error },
}
