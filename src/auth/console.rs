//! Terminal presence confirmation
//!
//! Asks the person at the controlling terminal to confirm they are present.
//! This is a presence check, not biometric recognition; it stands in for the
//! platform prompt on hosts without one.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{
    codes, AuthEvent, AuthEventSender, Authenticator, Availability, CancelSource, PromptInfo,
};

/// Controlling terminal on unix hosts
pub const DEFAULT_TTY_PATH: &str = "/dev/tty";

pub struct ConsoleAuthenticator {
    tty: PathBuf,
}

impl ConsoleAuthenticator {
    pub fn new() -> Self {
        Self::with_tty(DEFAULT_TTY_PATH)
    }

    pub fn with_tty(path: impl Into<PathBuf>) -> Self {
        Self { tty: path.into() }
    }
}

impl Default for ConsoleAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

/// Map one line of terminal input to an event.
fn classify_answer(answer: &str) -> AuthEvent {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => AuthEvent::Succeeded,
        "n" | "no" => AuthEvent::Canceled(CancelSource::NegativeButton),
        _ => AuthEvent::Mismatch,
    }
}

fn run_prompt(tty: &Path, info: &PromptInfo, events: &AuthEventSender) {
    let file = match OpenOptions::new().read(true).write(true).open(tty) {
        Ok(file) => file,
        Err(e) => {
            warn!(tty = %tty.display(), error = %e, "Cannot open terminal for prompt");
            events.blocking_send(AuthEvent::from_platform_error(
                codes::HW_UNAVAILABLE,
                format!("Cannot open {}: {}", tty.display(), e),
            ));
            return;
        }
    };

    let mut writer = match file.try_clone() {
        Ok(writer) => writer,
        Err(e) => {
            events.blocking_send(AuthEvent::from_platform_error(
                codes::UNABLE_TO_PROCESS,
                e.to_string(),
            ));
            return;
        }
    };
    let mut reader = BufReader::new(file);
    let budget = info.max_failed_attempts.max(1);
    let mut mismatches = 0;

    loop {
        if events.is_closed() {
            return;
        }

        let shown = write!(
            writer,
            "\n{}\n{}\nConfirm presence [y] or {} [n]: ",
            info.title, info.subtitle, info.negative_button
        )
        .and_then(|_| writer.flush());
        if let Err(e) = shown {
            events.blocking_send(AuthEvent::from_platform_error(
                codes::UNABLE_TO_PROCESS,
                e.to_string(),
            ));
            return;
        }

        let mut line = String::new();
        let event = match reader.read_line(&mut line) {
            Ok(0) => AuthEvent::Canceled(CancelSource::System),
            Ok(_) => classify_answer(&line),
            Err(e) => AuthEvent::from_platform_error(codes::UNABLE_TO_PROCESS, e.to_string()),
        };

        let keep_prompting = event == AuthEvent::Mismatch;
        if !events.blocking_send(event) || !keep_prompting {
            return;
        }

        // The gate locks out on this mismatch; nobody is left to answer
        mismatches += 1;
        if mismatches >= budget {
            debug!(mismatches, "Attempt budget used up, closing prompt");
            return;
        }
        debug!("Unrecognized answer, prompting again");
    }
}

#[async_trait::async_trait]
impl Authenticator for ConsoleAuthenticator {
    fn id(&self) -> &str {
        "console"
    }

    fn availability(&self) -> Availability {
        if self.tty.exists() {
            Availability::Available
        } else {
            Availability::NoHardware
        }
    }

    async fn prompt(&self, info: &PromptInfo, events: AuthEventSender) {
        let tty = self.tty.clone();
        let info = info.clone();
        // Terminal reads block; a panic there surfaces as a system cancel
        let _ = tokio::task::spawn_blocking(move || run_prompt(&tty, &info, &events)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_answer() {
        assert_eq!(classify_answer("y\n"), AuthEvent::Succeeded);
        assert_eq!(classify_answer(" YES "), AuthEvent::Succeeded);
        assert_eq!(
            classify_answer("n"),
            AuthEvent::Canceled(CancelSource::NegativeButton)
        );
        assert_eq!(classify_answer("maybe"), AuthEvent::Mismatch);
    }

    #[test]
    fn test_missing_terminal_is_unavailable() {
        let authenticator = ConsoleAuthenticator::with_tty("/nonexistent/tty");
        assert_eq!(authenticator.availability(), Availability::NoHardware);
    }

    #[cfg(target_os = "linux")]
    mod pty {
        use std::fs::File;
        use std::io::{ErrorKind, Read};
        use std::os::fd::{AsRawFd, FromRawFd};
        use std::path::PathBuf;
        use std::sync::mpsc as std_mpsc;
        use std::time::Duration;

        use tokio::sync::mpsc;

        use crate::auth::console::run_prompt;
        use crate::auth::{AuthEvent, AuthEventSender, PromptInfo};

        /// Master end of a fresh pseudo terminal, its slave end and the
        /// slave's device path.
        fn open_pty() -> (File, File, PathBuf) {
            let mut master = -1;
            let mut slave = -1;
            let rc = unsafe {
                libc::openpty(
                    &mut master,
                    &mut slave,
                    std::ptr::null_mut(),
                    std::ptr::null(),
                    std::ptr::null(),
                )
            };
            assert_eq!(rc, 0, "openpty failed");

            let mut name = [0 as libc::c_char; 128];
            let rc = unsafe { libc::ttyname_r(slave, name.as_mut_ptr(), name.len()) };
            assert_eq!(rc, 0, "ttyname_r failed");
            let path = unsafe { std::ffi::CStr::from_ptr(name.as_ptr()) }
                .to_string_lossy()
                .into_owned();

            let master = unsafe { File::from_raw_fd(master) };
            let slave = unsafe { File::from_raw_fd(slave) };
            (master, slave, PathBuf::from(path))
        }

        /// Everything the prompt wrote so far.
        fn drain(master: &mut File) -> String {
            unsafe {
                let fd = master.as_raw_fd();
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }

            let mut output = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                match master.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => output.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            String::from_utf8_lossy(&output).into_owned()
        }

        #[test]
        fn test_no_prompt_after_last_allowed_mismatch() {
            let (mut master, _slave, tty) = open_pty();
            std::io::Write::write_all(&mut master, b"a\nb\n").unwrap();

            // Receiver stays open, as it does while the gate is still
            // folding the final mismatch into a lockout
            let (tx, mut rx) = mpsc::channel(16);
            let events = AuthEventSender::new(tx);
            let info = PromptInfo {
                max_failed_attempts: 2,
                ..PromptInfo::default()
            };

            let (done_tx, done_rx) = std_mpsc::channel();
            std::thread::spawn(move || {
                run_prompt(&tty, &info, &events);
                let _ = done_tx.send(());
            });

            assert!(
                done_rx.recv_timeout(Duration::from_secs(5)).is_ok(),
                "prompt still waiting for input after lockout"
            );
            assert_eq!(rx.try_recv().unwrap(), AuthEvent::Mismatch);
            assert_eq!(rx.try_recv().unwrap(), AuthEvent::Mismatch);
            assert!(rx.try_recv().is_err());

            let shown = drain(&mut master);
            assert_eq!(shown.matches("Confirm presence").count(), 2);
        }

        #[test]
        fn test_answer_after_mismatch_succeeds() {
            let (mut master, _slave, tty) = open_pty();
            std::io::Write::write_all(&mut master, b"maybe\ny\n").unwrap();

            let (tx, mut rx) = mpsc::channel(16);
            run_prompt(&tty, &PromptInfo::default(), &AuthEventSender::new(tx));

            assert_eq!(rx.try_recv().unwrap(), AuthEvent::Mismatch);
            assert_eq!(rx.try_recv().unwrap(), AuthEvent::Succeeded);
            assert_eq!(drain(&mut master).matches("Confirm presence").count(), 2);
        }
    }
}
