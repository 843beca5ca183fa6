mod attrs;
mod error;
mod fs;
mod handles;
mod node;
mod pathbuf;
mod repair;

use std::ffi::OsString;
use std::path::PathBuf;

use clap::Parser;
use fuser::MountOption;

use error::StartupError;
use fs::Sdcardfs;

/// Mount point is fixed, per the external-interfaces contract. This daemon
/// never mounts anywhere else.
const MOUNT_POINT: &str = "/mnt/sdcard";

#[derive(Parser, Debug)]
#[command(
    name = "sdcardfs",
    about = "Exports a backing directory through FUSE under a fixed FAT-like ownership policy",
    disable_help_flag = true,
    disable_version_flag = true
)]
struct Cli {
    /// Enable case folding on reported paths.
    #[arg(short = 'l')]
    fold_case: bool,

    /// Run the ownership/case repair pass before mounting.
    #[arg(short = 'f')]
    repair: bool,

    backing_path: PathBuf,
    uid: u32,
    gid: u32,
}

fn main() {
    if let Err(err) = run() {
        // Printed directly rather than through `log::error!`: the logger's
        // own filter (off unless RUST_LOG is set) would otherwise swallow a
        // startup failure, and §6 requires the usage/error message to
        // actually reach the user.
        eprintln!("{}", err);
        std::process::exit(-1);
    }
}

fn run() -> Result<(), StartupError> {
    env_logger::init();

    let cli = Cli::try_parse().map_err(|_| StartupError::Usage)?;

    if cli.uid == 0 || cli.gid == 0 {
        return Err(StartupError::ZeroId);
    }
    if !cli.backing_path.is_dir() {
        return Err(StartupError::BadBackingPath(cli.backing_path));
    }

    log::info!(
        "starting: backing_path={:?} uid={} gid={} fold_case={} repair={}",
        cli.backing_path, cli.uid, cli.gid, cli.fold_case, cli.repair
    );

    unmount_stale_mount();

    let options = vec![
        MountOption::FSName("sdcardfs".to_string()),
        MountOption::DefaultPermissions,
        MountOption::AllowOther,
        MountOption::RW,
        MountOption::CUSTOM(format!("uid={}", cli.uid)),
        MountOption::CUSTOM(format!("gid={}", cli.gid)),
    ];

    let backing_path = cli
        .backing_path
        .canonicalize()
        .map_err(|_| StartupError::BadBackingPath(cli.backing_path.clone()))?;

    let filesystem = Sdcardfs::new(OsString::from(backing_path.as_os_str()), cli.gid, cli.fold_case);

    // `Session::new` performs the actual open-device-and-mount step; `run`
    // is the blocking request loop. Keeping them separate (rather than the
    // combined `fuser::mount2`) lets a mount failure map to the "-1"
    // startup-failure exit code while a later fatal channel error still
    // exits "0" for "kernel closed the channel".
    let mut session =
        fuser::Session::new(filesystem, MOUNT_POINT, &options).map_err(StartupError::Mount)?;

    if cli.repair {
        log::info!("running repair pass over {:?}", backing_path);
        repair::repair_tree(&backing_path, cli.uid, cli.gid);
    }

    drop_privileges(cli.uid, cli.gid)?;

    log::info!("entering request loop");
    match session.run() {
        Ok(()) => {
            log::info!("kernel closed the channel, exiting");
            Ok(())
        }
        Err(err) => {
            log::error!("fatal channel error: {}", err);
            // The request loop only returns on a fatal read error; that
            // still gets a clean process exit (status 0), not the -1 used
            // for startup failures.
            std::process::exit(0);
        }
    }
}

fn unmount_stale_mount() {
    let cpath = match std::ffi::CString::new(MOUNT_POINT) {
        Ok(cpath) => cpath,
        Err(_) => return,
    };
    let rc = unsafe { libc::umount2(cpath.as_ptr(), libc::MNT_FORCE) };
    if rc != 0 {
        log::debug!(
            "unmount of stale {} ignored: {}",
            MOUNT_POINT,
            std::io::Error::last_os_error()
        );
    }
}

fn drop_privileges(uid: u32, gid: u32) -> Result<(), StartupError> {
    let rc = unsafe { libc::setgid(gid) };
    if rc != 0 {
        return Err(StartupError::SetGid { gid, source: std::io::Error::last_os_error() });
    }
    let rc = unsafe { libc::setuid(uid) };
    if rc != 0 {
        return Err(StartupError::SetUid { uid, source: std::io::Error::last_os_error() });
    }
    unsafe {
        libc::umask(0);
    }
    Ok(())
}
