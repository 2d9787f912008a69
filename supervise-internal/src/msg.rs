//! The supervise protocol.
//!
//! Every message is a single datagram of ASCII text, `<tag>` or `<tag> <integer>`. Status messages flow from the
//! helper to its owner as [Event]s; control messages flow the other way as [Command]s.

use std::{fmt, str};

/// Why a message couldn't be parsed.
#[derive(Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum ParseError {
	#[error("message is not valid utf-8")]
	NotUtf8,
	#[error("message {0:?} is missing its code")]
	MissingCode(String),
	#[error("message {0:?} has a non-integer code")]
	BadCode(String),
	#[error("unknown command {0:?}")]
	UnknownCommand(String),
}

/// A status message from the helper.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Event {
	/// The command has been started with this pid.
	Pid(i32),
	/// The command exited normally with this code.
	Exited(i32),
	/// The command was killed by this signal.
	Killed(i32),
	/// The command was killed by this signal and dumped core.
	Dumped(i32),
	/// No descendant processes remain.
	NoChildren,
	/// The helper is exiting cleanly; nothing more will be sent.
	Terminating,
	/// The channel closed without a `terminating`: the helper died abnormally.
	Hangup,
	/// A tag this version doesn't know about.
	Other(String, Option<i32>),
}

impl Event {
	/// Parse a single received message. Trailing whitespace is ignored.
	pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
		let (tag, code) = split(buf)?;
		let need = |code: Option<i32>| code.ok_or_else(|| ParseError::MissingCode(tag.to_owned()));
		Ok(match tag {
			"pid" => Event::Pid(need(code)?),
			"exited" => Event::Exited(need(code)?),
			"killed" => Event::Killed(need(code)?),
			"dumped" => Event::Dumped(need(code)?),
			"no_children" => Event::NoChildren,
			"terminating" => Event::Terminating,
			"" => Event::Hangup,
			tag => Event::Other(tag.to_owned(), code),
		})
	}

	/// The returncode this event implies: the exit code, or the negated signal number.
	pub fn returncode(&self) -> Option<i32> {
		match *self {
			Event::Exited(code) => Some(code),
			Event::Killed(signal) | Event::Dumped(signal) => Some(-signal),
			_ => None,
		}
	}
}

impl fmt::Display for Event {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Event::Pid(pid) => write!(f, "pid {}", pid),
			Event::Exited(code) => write!(f, "exited {}", code),
			Event::Killed(signal) => write!(f, "killed {}", signal),
			Event::Dumped(signal) => write!(f, "dumped {}", signal),
			Event::NoChildren => f.write_str("no_children"),
			Event::Terminating => f.write_str("terminating"),
			Event::Hangup => Ok(()),
			Event::Other(tag, None) => f.write_str(tag),
			Event::Other(tag, Some(code)) => write!(f, "{} {}", tag, code),
		}
	}
}

/// A control message to the helper.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Command {
	/// Deliver this signal to the main child process.
	Signal(i32),
}

impl Command {
	pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
		match split(buf)? {
			("signal", Some(signal)) => Ok(Command::Signal(signal)),
			("signal", None) => Err(ParseError::MissingCode(String::from("signal"))),
			(tag, _) => Err(ParseError::UnknownCommand(tag.to_owned())),
		}
	}
}

impl fmt::Display for Command {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Command::Signal(signal) => write!(f, "signal {}", signal),
		}
	}
}

fn split(buf: &[u8]) -> Result<(&str, Option<i32>), ParseError> {
	let msg = str::from_utf8(buf).map_err(|_| ParseError::NotUtf8)?.trim_end();
	let mut parts = msg.split(' ');
	let tag = parts.next().unwrap_or("");
	let code = match parts.next() {
		Some(code) => Some(
			code.parse::<i32>()
				.map_err(|_| ParseError::BadCode(msg.to_owned()))?,
		),
		None => None,
	};
	Ok((tag, code))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_status_messages() {
		assert_eq!(Event::parse(b"pid 4242"), Ok(Event::Pid(4242)));
		assert_eq!(Event::parse(b"exited 3\n"), Ok(Event::Exited(3)));
		assert_eq!(Event::parse(b"killed 15"), Ok(Event::Killed(15)));
		assert_eq!(Event::parse(b"dumped 11 \n"), Ok(Event::Dumped(11)));
		assert_eq!(Event::parse(b"no_children"), Ok(Event::NoChildren));
		assert_eq!(Event::parse(b"terminating\n"), Ok(Event::Terminating));
	}

	#[test]
	fn empty_message_is_hangup() {
		assert_eq!(Event::parse(b""), Ok(Event::Hangup));
		assert_eq!(Event::parse(b" \n"), Ok(Event::Hangup));
	}

	#[test]
	fn unknown_tags_are_kept() {
		assert_eq!(
			Event::parse(b"reparented 77"),
			Ok(Event::Other(String::from("reparented"), Some(77)))
		);
		assert_eq!(Event::parse(b"stopped"), Ok(Event::Other(String::from("stopped"), None)));
	}

	#[test]
	fn malformed_messages() {
		assert_eq!(Event::parse(b"pid"), Err(ParseError::MissingCode(String::from("pid"))));
		assert_eq!(
			Event::parse(b"exited zero"),
			Err(ParseError::BadCode(String::from("exited zero")))
		);
		assert_eq!(Event::parse(b"pid \xff"), Err(ParseError::NotUtf8));
		// a single space separates tag from code
		assert!(Event::parse(b"exited  0").is_err());
	}

	#[test]
	fn returncodes() {
		assert_eq!(Event::Exited(0).returncode(), Some(0));
		assert_eq!(Event::Exited(2).returncode(), Some(2));
		assert_eq!(Event::Killed(9).returncode(), Some(-9));
		assert_eq!(Event::Dumped(6).returncode(), Some(-6));
		assert_eq!(Event::Pid(1).returncode(), None);
		assert_eq!(Event::Hangup.returncode(), None);
	}

	#[test]
	fn display_matches_wire_format() {
		for event in &[
			Event::Pid(10),
			Event::Exited(0),
			Event::Killed(15),
			Event::Dumped(11),
			Event::NoChildren,
			Event::Terminating,
			Event::Hangup,
		] {
			assert_eq!(Event::parse(event.to_string().as_bytes()).as_ref(), Ok(event));
		}
		assert_eq!(Command::Signal(15).to_string(), "signal 15");
	}

	#[test]
	fn parses_commands() {
		assert_eq!(Command::parse(b"signal 9"), Ok(Command::Signal(9)));
		assert_eq!(
			Command::parse(b"signal"),
			Err(ParseError::MissingCode(String::from("signal")))
		);
		assert_eq!(
			Command::parse(b"kill 9"),
			Err(ParseError::UnknownCommand(String::from("kill")))
		);
	}
}
