//! Startup check sequence run before the service accepts work (spec §6):
//! "report pass/fail before accepting work".

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupCheck {
    pub name: String,
    pub status: CheckStatus,
    pub detail: Option<String>,
}

impl StartupCheck {
    fn pass(name: &str) -> Self {
        StartupCheck { name: name.to_string(), status: CheckStatus::Pass, detail: None }
    }

    fn fail(name: &str, detail: impl Into<String>) -> Self {
        StartupCheck { name: name.to_string(), status: CheckStatus::Fail, detail: Some(detail.into()) }
    }
}

/// Pre-flight checks (spec §6): elevated privileges, required env vars,
/// FUSE library present, log directory writable, config directory present.
/// Run before IPC/FUSE/scheduler come up.
pub async fn run_preflight(config_dir: &Path, log_dir: &Path) -> Vec<StartupCheck> {
    let mut checks = Vec::new();

    checks.push(check_privileges());
    checks.push(check_env_vars());
    checks.push(check_fuse_available());
    checks.push(check_dir_writable("log directory writable", log_dir).await);
    checks.push(check_dir_present("config directory present", config_dir).await);

    for check in &checks {
        match check.status {
            CheckStatus::Pass => info!(check = %check.name, "startup check passed"),
            CheckStatus::Fail => error!(check = %check.name, detail = ?check.detail, "startup check failed"),
        }
    }
    checks
}

/// Post-mount checks (spec §6): IPC listener up, config loaded, FUSE
/// mounted, backing-directory protection applied, index built, scheduler
/// up, queued notifications flushed. Each is appended as the corresponding
/// subsystem actually comes online, by [`crate::service::Service::start`].
pub fn record(checks: &mut Vec<StartupCheck>, name: &str, result: Result<(), String>) {
    let check = match result {
        Ok(()) => StartupCheck::pass(name),
        Err(detail) => StartupCheck::fail(name, detail),
    };
    if check.status == CheckStatus::Fail {
        warn!(check = %name, "post-mount startup check failed");
    }
    checks.push(check);
}

#[cfg(target_os = "linux")]
fn check_privileges() -> StartupCheck {
    if unsafe { libc::geteuid() } == 0 {
        StartupCheck::pass("elevated privileges")
    } else {
        StartupCheck::fail("elevated privileges", "service is not running as root")
    }
}

#[cfg(not(target_os = "linux"))]
fn check_privileges() -> StartupCheck {
    StartupCheck::pass("elevated privileges")
}

fn check_env_vars() -> StartupCheck {
    if std::env::var(crate::config::REAL_HOME_ENV).is_ok() || dirs::home_dir().is_some() {
        StartupCheck::pass("required environment variables")
    } else {
        StartupCheck::fail("required environment variables", "could not resolve a home directory")
    }
}

#[cfg(target_os = "linux")]
fn check_fuse_available() -> StartupCheck {
    if Path::new("/dev/fuse").exists() {
        StartupCheck::pass("FUSE library present and loadable")
    } else {
        StartupCheck::fail("FUSE library present and loadable", "/dev/fuse not found")
    }
}

#[cfg(not(target_os = "linux"))]
fn check_fuse_available() -> StartupCheck {
    StartupCheck::pass("FUSE library present and loadable")
}

async fn check_dir_writable(name: &str, dir: &Path) -> StartupCheck {
    if tokio::fs::create_dir_all(dir).await.is_err() {
        return StartupCheck::fail(name, format!("could not create {}", dir.display()));
    }
    let probe = dir.join(".tierfs-write-probe");
    match tokio::fs::write(&probe, b"ok").await {
        Ok(()) => {
            let _ = tokio::fs::remove_file(&probe).await;
            StartupCheck::pass(name)
        }
        Err(e) => StartupCheck::fail(name, e.to_string()),
    }
}

async fn check_dir_present(name: &str, dir: &Path) -> StartupCheck {
    match tokio::fs::create_dir_all(dir).await {
        Ok(()) => StartupCheck::pass(name),
        Err(e) => StartupCheck::fail(name, e.to_string()),
    }
}
