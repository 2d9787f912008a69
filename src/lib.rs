//! Fd-managed child processes.
//!
//! This library launches processes under the `supervise` utility, and tracks them over a single file descriptor.
//!
//! The key ideas are:
//!
//!  * **No orphans:** The launched process and all its transitive children are terminated when the [Process] is
//!    closed or dropped, or when this process exits. `supervise` guarantees this when its channel closes.
//!  * **One fd per process:** The [Process] is backed by a single fd which becomes readable whenever there's news
//!    (a pid, an exit, a hangup). Poll it alongside anything else, then call [`Process::poll()`] to read off events.
//!  * **Simultaneous fd updates:** [Fds] describes the new process's fd table as a batch of updates that are applied
//!    all at once, so swaps and fan-outs just work.
//!
//! ```no_run
//! # use supervise_api::{Options, Process};
//! let mut process = Process::new(&["/bin/sh", "-c", "exit 3"], &Options::default()).unwrap();
//! assert_eq!(process.wait().unwrap(), Some(3));
//! ```

#![doc(html_root_url = "https://docs.rs/supervise-api/0.1.0")]
#![warn(
	missing_copy_implementations,
	missing_debug_implementations,
	// missing_docs,
	trivial_casts,
	trivial_numeric_casts,
	unused_import_braces,
	unused_qualifications,
	unused_results,
	clippy::pedantic
)] // from https://github.com/rust-unofficial/patterns/blob/master/anti_patterns/deny-warnings.md
#![allow(
	clippy::module_name_repetitions,
	clippy::must_use_candidate,
	clippy::missing_errors_doc
)]

mod dfork;
mod error;
pub mod fds;
mod process;

use nix::sys::signal::{self, SigHandler, Signal};

pub use dfork::{dfork, ChannelFlags, Options};
pub use error::Error;
pub use fds::{update_fds, Fds};
pub use nix::unistd::Pid;
pub use process::Process;
pub use supervise_internal::{msg, Command, Event, Fd, ParseError, RETURNCODE_KILLED, SUPERVISE};

/// Mark `SIGCHLD` as `SIG_IGN`, so that exited children are reaped by the kernel.
///
/// Nothing in this crate waits on the `supervise` processes it forks, so unless this is called (or the application
/// reaps them some other way) each will linger as a zombie until this process exits. This is process-wide, so it's
/// left to the application to opt in. The processes launched by [dfork()] start with `SIGCHLD` reset to default.
pub fn ignore_sigchld() -> nix::Result<()> {
	let _ = unsafe { signal::signal(Signal::SIGCHLD, SigHandler::SigIgn) }?;
	Ok(())
}
