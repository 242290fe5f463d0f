//! Authenticates the connecting UI process by uid over the Unix socket
//! peer-credential mechanism, rejecting anyone else (spec §4.11).

use std::os::unix::io::AsRawFd;

use tokio::net::UnixStream;

use crate::error::ServiceError;

/// uid the connecting peer must match: the daemon's own uid, unless an
/// explicit allow-listed UI uid is configured.
pub struct PeerAuth {
    allowed_uid: u32,
}

impl PeerAuth {
    pub fn new(allowed_uid: Option<u32>) -> Self {
        let allowed_uid = allowed_uid.unwrap_or_else(|| unsafe { libc::getuid() });
        PeerAuth { allowed_uid }
    }

    pub fn check(&self, stream: &UnixStream) -> Result<(), ServiceError> {
        let peer_uid = peer_uid(stream)?;
        if peer_uid != self.allowed_uid {
            return Err(ServiceError::PermissionDenied(format!(
                "rejected control-plane connection from uid {peer_uid}"
            )));
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn peer_uid(stream: &UnixStream) -> Result<u32, ServiceError> {
    let fd = stream.as_raw_fd();
    let mut cred = libc::ucred { pid: 0, uid: 0, gid: 0 };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(ServiceError::Internal("SO_PEERCRED lookup failed".to_string()));
    }
    Ok(cred.uid)
}

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
fn peer_uid(stream: &UnixStream) -> Result<u32, ServiceError> {
    let fd = stream.as_raw_fd();
    let mut uid: libc::uid_t = 0;
    let mut gid: libc::gid_t = 0;
    let rc = unsafe { libc::getpeereid(fd, &mut uid, &mut gid) };
    if rc != 0 {
        return Err(ServiceError::Internal("getpeereid lookup failed".to_string()));
    }
    Ok(uid)
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
fn peer_uid(_stream: &UnixStream) -> Result<u32, ServiceError> {
    Err(ServiceError::Internal("peer credential lookup unsupported on this platform".to_string()))
}
