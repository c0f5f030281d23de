// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Host and process information, wall-clock helpers.

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Static description of the running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub host_name: String,
    pub process_id: i32,
    pub process_name: String,
    pub unit_name: String,
}

impl ProcessInfo {
    pub fn current(unit_name: &str) -> Self {
        Self {
            host_name: host_name().to_string(),
            process_id: process_id(),
            process_name: process_name(),
            unit_name: unit_name.to_string(),
        }
    }
}

/// Host name, resolved once.
pub fn host_name() -> &'static str {
    static HOST: OnceLock<String> = OnceLock::new();
    HOST.get_or_init(resolve_host_name)
}

#[cfg(unix)]
fn resolve_host_name() -> String {
    let mut buf = [0u8; 256];
    // SAFETY:
    // - buf is a valid writable buffer of buf.len() bytes
    // - gethostname writes at most len bytes and NUL-terminates on success
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        log::debug!("[CONTEXT] gethostname failed, falling back to localhost");
        return "localhost".to_string();
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

#[cfg(not(unix))]
fn resolve_host_name() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}

pub fn process_id() -> i32 {
    std::process::id() as i32
}

fn process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default()
}

/// Microseconds since the Unix epoch.
pub fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Whether a process with this pid still exists on this host.
#[cfg(unix)]
pub fn is_process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: kill with signal 0 performs permission and existence checks only
    let ret = unsafe { libc::kill(pid, 0) };
    if ret == 0 {
        return true;
    }
    // EPERM: exists but owned by another user
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: i32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(process_id()));
        assert!(!is_process_alive(0));
    }

    #[test]
    fn test_host_name_stable() {
        assert!(!host_name().is_empty());
        assert_eq!(host_name(), host_name());
    }

    #[test]
    fn test_now_us_monotonic_enough() {
        let a = now_us();
        let b = now_us();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000_000);
    }
}
