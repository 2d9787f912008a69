use log::{trace, warn};
use nix::{
	errno::Errno, fcntl::{self, FcntlArg, OFlag}, poll::{self, PollFd, PollFlags, PollTimeout}, sys::{
		signal::Signal, socket::{self, MsgFlags}
	}, unistd::Pid
};
use std::{
	iter, os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd}
};

use super::{dfork, Error, Options};
use supervise_internal::{Command, Event, Fd, MESSAGE_MAX, RETURNCODE_KILLED};

/// Run a new process and track it.
///
/// This API is mostly compatible with `std::process::Child`, but better:
///  * The process and all its transitive children are terminated when the `Process` is dropped or closed.
///  * It's file descriptor based, so one can use select/poll to be notified of changes.
///
/// The fd is available via [`fileno()`](Process::fileno) or [`AsRawFd`]; poll it for readability to get notified
/// of changes, then call [`poll()`](Process::poll) or the other methods to read off events.
#[derive(Debug)]
pub struct Process {
	fd: Option<OwnedFd>,
	pid: Option<Pid>,
	returncode: Option<i32>,
	childfree: bool,
	hangup: bool,
}

/// The result of a single non-blocking read of the channel.
enum Recv {
	Message(usize),
	Empty,
	Closed,
}

impl Process {
	/// Launch `args`. See [dfork()] for `options`.
	///
	/// Blocks until the helper reports the pid, and fails with [`Error::StartupFailed`] if it hangs up first.
	pub fn new<S: AsRef<str>>(args: &[S], options: &Options) -> Result<Self, Error> {
		let mut process = Self::from_fd(dfork(args, options)?)?;
		while process.pid.is_none() {
			if process.closed() {
				return Err(Error::StartupFailed);
			}
			process.wait_readable()?;
			process.flush_events()?;
		}
		Ok(process)
	}

	/// Track the process behind a channel returned by [dfork()]. Unlike [`new()`](Process::new) this doesn't wait
	/// for the pid.
	pub fn from_fd(fd: OwnedFd) -> Result<Self, Error> {
		let flags = OFlag::from_bits_truncate(fcntl::fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
		let _ = fcntl::fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
		Ok(Self {
			fd: Some(fd),
			pid: None,
			returncode: None,
			childfree: false,
			hangup: false,
		})
	}

	/// The pid of the main child process, once reported.
	pub fn pid(&self) -> Option<Pid> {
		self.pid
	}

	/// The exit code if it exited normally, the negated signal number if it was signalled, or `None` if it's
	/// still running or never reported.
	///
	/// Doesn't check for new events; see [`poll()`](Process::poll).
	pub fn returncode(&self) -> Option<i32> {
		self.returncode
	}

	/// True once the helper has confirmed no descendant processes remain.
	pub fn childfree(&self) -> bool {
		self.childfree
	}

	/// True if the channel closed without a `terminating`, i.e. the helper died uncleanly.
	pub fn hangup(&self) -> bool {
		self.hangup
	}

	/// True if the channel to the helper is closed.
	pub fn closed(&self) -> bool {
		self.fd.is_none()
	}

	/// The channel fd, or -1 if closed.
	pub fn fileno(&self) -> Fd {
		self.fd.as_ref().map_or(-1, AsRawFd::as_raw_fd)
	}

	/// The channel fd, unless closed.
	pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
		self.fd.as_ref().map(AsFd::as_fd)
	}

	/// Close the channel, killing the process and all descendants.
	pub fn close(&mut self) {
		if self.returncode.is_none() {
			self.returncode = Some(RETURNCODE_KILLED);
		}
		self.release();
	}

	fn release(&mut self) {
		if let Some(fd) = self.fd.take() {
			trace!("{}: releasing channel fd {}", self, fd.as_raw_fd());
		}
	}

	fn read_event(&mut self, buf: &mut [u8]) -> Result<Recv, Error> {
		let fd = match &self.fd {
			Some(fd) => fd.as_raw_fd(),
			None => return Ok(Recv::Closed),
		};
		loop {
			break match socket::recv(fd, buf, MsgFlags::empty()) {
				Ok(len) => Ok(Recv::Message(len)),
				Err(Errno::EAGAIN) => Ok(Recv::Empty),
				Err(Errno::EINTR) => continue,
				Err(err) => Err(err.into()),
			};
		}
	}

	fn handle_event(&mut self, event: &Event) {
		trace!("{}: {:?}", self, event);
		match *event {
			Event::Pid(pid) => {
				if let Some(existing) = self.pid {
					warn!("{}: ignoring second pid report {} (have {})", self, pid, existing);
				} else {
					self.pid = Some(Pid::from_raw(pid));
				}
			}
			Event::Exited(_) | Event::Killed(_) | Event::Dumped(_) => {
				if self.returncode.is_none() {
					self.returncode = event.returncode();
				}
			}
			Event::NoChildren => self.childfree = true,
			Event::Terminating => {
				self.childfree = true;
				self.release();
			}
			// This can only happen if supervise was SIGKILL'd (or worse)
			Event::Hangup => {
				self.hangup = true;
				self.release();
			}
			Event::Other(ref tag, _) => warn!("{}: ignoring unknown event {:?}", self, tag),
		}
	}

	/// Read and handle a single event, oldest first. `None` if there are no new events.
	pub fn get_event(&mut self) -> Result<Option<Event>, Error> {
		let mut buf = [0; MESSAGE_MAX];
		let event = match self.read_event(&mut buf)? {
			Recv::Empty | Recv::Closed => return Ok(None),
			Recv::Message(0) => Event::Hangup,
			Recv::Message(len) => Event::parse(&buf[..len])?,
		};
		self.handle_event(&event);
		Ok(Some(event))
	}

	/// Iterate over unprocessed events.
	pub fn events(&mut self) -> impl Iterator<Item = Result<Event, Error>> + '_ {
		iter::from_fn(move || self.get_event().transpose())
	}

	/// Check for events, handle them, and throw them away.
	pub fn flush_events(&mut self) -> Result<(), Error> {
		while self.get_event()?.is_some() {}
		Ok(())
	}

	/// Block until the channel is readable or hung up. Returns immediately if it's closed.
	fn wait_readable(&self) -> Result<(), Error> {
		if let Some(fd) = self.as_fd() {
			let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
			loop {
				match poll::poll(&mut fds, PollTimeout::NONE) {
					Err(Errno::EINTR) => continue,
					result => break result.map(drop)?,
				}
			}
		}
		Ok(())
	}

	/// Check if the process has exited. `None` if it's still running.
	pub fn poll(&mut self) -> Result<Option<i32>, Error> {
		self.flush_events()?;
		Ok(self.returncode)
	}

	/// Wait for the process to exit.
	///
	/// Returns `None` only if the helper hung up without reporting an exit.
	pub fn wait(&mut self) -> Result<Option<i32>, Error> {
		while self.returncode.is_none() && !self.closed() {
			self.wait_readable()?;
			self.flush_events()?;
		}
		Ok(self.returncode)
	}

	/// Send this signal to the main child process.
	pub fn send_signal(&self, signal: i32) -> Result<(), Error> {
		let fd = self.fd.as_ref().ok_or(Error::Closed)?;
		let command = Command::Signal(signal);
		trace!("{}: sending {:?}", self, command);
		let _ = socket::send(
			fd.as_raw_fd(),
			command.to_string().as_bytes(),
			MsgFlags::MSG_NOSIGNAL,
		)?;
		Ok(())
	}

	/// Terminate the main child process with SIGTERM.
	///
	/// Note that this does not kill all descendant processes. For that, [`close()`](Process::close).
	pub fn terminate(&self) -> Result<(), Error> {
		self.send_signal(Signal::SIGTERM as i32)
	}

	/// Kill the main child process with SIGKILL.
	///
	/// Note that this does not kill all descendant processes. For that, [`close()`](Process::close).
	pub fn kill(&self) -> Result<(), Error> {
		self.send_signal(Signal::SIGKILL as i32)
	}
}

impl AsRawFd for Process {
	fn as_raw_fd(&self) -> RawFd {
		self.fileno()
	}
}

impl Drop for Process {
	fn drop(&mut self) {
		// dropping the channel is what kills the process tree
		self.release();
	}
}

impl std::fmt::Display for Process {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self.pid {
			Some(pid) => write!(f, "process {}", pid),
			None => f.write_str("process (starting)"),
		}
	}
}
