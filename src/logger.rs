// LININOIO ETHERD — LOGGING
// Records go to syslog when daemonized, to stderr when running in the
// foreground. Verbosity gates the debug level only.

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::ffi::CString;

struct EtherdLogger {
    to_stderr: bool,
}

impl Log for EtherdLogger {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.to_stderr {
            eprintln!("etherd: {}: {}", record.level(), record.args());
            return;
        }
        let prio = match record.level() {
            Level::Error => libc::LOG_ERR,
            Level::Warn => libc::LOG_WARNING,
            Level::Info => libc::LOG_INFO,
            Level::Debug | Level::Trace => libc::LOG_DEBUG,
        };
        let Ok(msg) = CString::new(format!("{}", record.args())) else {
            return;
        };
        unsafe {
            libc::syslog(prio, b"%s\0".as_ptr() as *const libc::c_char, msg.as_ptr());
        }
    }

    fn flush(&self) {}
}

pub fn init(to_stderr: bool, verbose: bool) {
    if !to_stderr {
        unsafe {
            libc::openlog(
                b"etherd\0".as_ptr() as *const libc::c_char,
                libc::LOG_PID,
                libc::LOG_DAEMON,
            );
        }
    }
    let max = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    // set_boxed_logger fails only when a logger is already installed
    let _ = log::set_boxed_logger(Box::new(EtherdLogger { to_stderr }));
    log::set_max_level(max);
}
