use std::io;

use supervise_internal::ParseError;

/// Errors returned by [dfork()](crate::dfork) and [Process](crate::Process).
///
/// The lifecycle of the launched process (its exit code, the signal that killed it, or the helper dying) is never
/// reported as an error; it's folded into the state of the [Process](crate::Process).
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// An argument couldn't be passed to `execve()`. Nothing was started.
	#[error("invalid argument: {0}")]
	InvalidArgument(String),
	/// The supervising helper isn't on the effective `PATH`. Nothing was started.
	#[error("{0} utility not found in path")]
	HelperNotFound(String),
	/// `fork()` failed. The channel was released before returning.
	#[error("fork failed: {0}")]
	Fork(#[source] nix::Error),
	/// The channel hung up before the helper reported a pid.
	#[error("starting process failed, couldn't even get pid")]
	StartupFailed,
	/// The channel to the helper has already been closed.
	#[error("communication fd is already closed")]
	Closed,
	/// The helper sent something that isn't a valid message.
	#[error("malformed message from helper: {0}")]
	Protocol(#[from] ParseError),
	#[error(transparent)]
	Sys(#[from] nix::Error),
	#[error(transparent)]
	Io(#[from] io::Error),
}
