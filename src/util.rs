use std::ffi::CStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn timestamp() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap()
}

/// Return the UNIX time in milliseconds.
pub fn get_time_ms() -> u64 {
    timestamp().as_millis() as u64
}

/// Return the UNIX time in microseconds.
pub fn ustime() -> u64 {
    timestamp().as_micros() as u64
}

pub fn add_ms_to_now(milliseconds: u64) -> u64 {
    get_time_ms() + milliseconds
}

#[cfg(target_os = "linux")]
pub fn error() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[cfg(target_os = "macos")]
pub fn error() -> i32 {
    unsafe { *libc::__error() }
}

/// The message for the calling thread's current errno.
pub fn strerror() -> String {
    unsafe { CStr::from_ptr(libc::strerror(error())).to_string_lossy().into_owned() }
}
