//! A minimal stand-in for the `supervise` utility, used by this crate's tests.
//!
//! ## Usage
//! ```text
//! supervise-stub <statusfd> <controlfd> <command> [<arg>]...
//! ```
//!
//! It speaks the supervise protocol for the main child process only: it reports its pid and how it exited, then
//! `no_children` and `terminating`. Signals requested over `controlfd` are delivered to the main child, and when
//! `controlfd` hangs up the main child is killed. Unlike the real utility it doesn't become a subreaper, so
//! descendants that outlive the main child are neither tracked nor killed.

#![warn(
	missing_debug_implementations,
	trivial_numeric_casts,
	unused_extern_crates,
	unused_import_braces,
	unused_qualifications,
	unused_results,
	clippy::pedantic,
)] // from https://github.com/rust-unofficial/patterns/blob/master/anti_patterns/deny-warnings.md

use nix::{
	errno::Errno, fcntl::{self, FcntlArg, FdFlag, OFlag}, libc, sys::{
		signal::{self, Signal}, socket::{self, MsgFlags}, wait::{self, WaitStatus}
	}, unistd::{self, ForkResult, Pid}
};
use std::{
	convert::TryFrom, env, ffi::{CString, OsString}, os::unix::ffi::OsStringExt, process, thread
};

use supervise_internal::{Command, Event, Fd, MESSAGE_MAX};

fn main() {
	let mut args = env::args_os().skip(1);
	let (statusfd, controlfd) = match (args.next().and_then(fd), args.next().and_then(fd)) {
		(Some(statusfd), Some(controlfd)) => (statusfd, controlfd),
		_ => usage(),
	};
	let argv = args
		.map(|arg| CString::new(arg.into_vec()).unwrap_or_else(|_| usage()))
		.collect::<Vec<_>>();
	if argv.is_empty() {
		usage();
	}

	// neither end is for the command
	for &fd in &[statusfd, controlfd] {
		let _ = fcntl::fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).expect("bad fd");
		let flags = OFlag::from_bits_truncate(fcntl::fcntl(fd, FcntlArg::F_GETFL).unwrap());
		let _ = fcntl::fcntl(fd, FcntlArg::F_SETFL(flags - OFlag::O_NONBLOCK)).unwrap();
	}

	let child = match unsafe { unistd::fork() }.expect("fork failed") {
		ForkResult::Child => {
			let _ = unistd::execvp(&argv[0], &argv);
			unsafe { libc::_exit(127) }
		}
		ForkResult::Parent { child } => child,
	};
	report(statusfd, &Event::Pid(child.as_raw()));

	let _ = thread::Builder::new()
		.name(String::from("control"))
		.spawn(move || control(controlfd, child))
		.unwrap();

	let exit = loop {
		match wait::waitpid(child, None) {
			Ok(WaitStatus::Exited(_, code)) => break Event::Exited(code),
			Ok(WaitStatus::Signaled(_, signal, false)) => break Event::Killed(signal as i32),
			Ok(WaitStatus::Signaled(_, signal, true)) => break Event::Dumped(signal as i32),
			Ok(_) | Err(Errno::EINTR) => (),
			Err(err) => panic!("waitpid: {}", err),
		}
	};
	report(statusfd, &exit);
	report(statusfd, &Event::NoChildren);
	report(statusfd, &Event::Terminating);
}

/// Handle commands until the owner hangs up, then kill the child.
fn control(controlfd: Fd, child: Pid) {
	let mut buf = [0; MESSAGE_MAX];
	loop {
		match socket::recv(controlfd, &mut buf, MsgFlags::empty()) {
			Ok(0) => break,
			Ok(len) => match Command::parse(&buf[..len]) {
				Ok(Command::Signal(signal)) => {
					if let Ok(signal) = Signal::try_from(signal) {
						let _ = signal::kill(child, signal);
					}
				}
				Err(err) => eprintln!("supervise-stub: {}", err),
			},
			Err(Errno::EINTR) => (),
			Err(_) => break,
		}
	}
	// the main thread reaps it
	let _ = signal::kill(child, Signal::SIGKILL);
}

fn report(statusfd: Fd, event: &Event) {
	// the owner may well have gone away
	let _ = socket::send(statusfd, event.to_string().as_bytes(), MsgFlags::MSG_NOSIGNAL);
}

fn fd(arg: OsString) -> Option<Fd> {
	arg.into_string().ok()?.parse().ok()
}

fn usage() -> ! {
	eprintln!("usage: supervise-stub <statusfd> <controlfd> <command> [<arg>]...");
	process::exit(2)
}
