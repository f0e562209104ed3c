//! Board console access.
//!
//! A [`ConsoleSession`] owns the live connection to a board console (a spawned
//! connection command or a serial port) and offers the raw `send`/`expect`
//! primitives. A [`CommandRunner`] layers command execution on top of it and
//! recovers the exit status of each command from the otherwise unstructured
//! shell output, by echoing `$?` between two markers after the command.
//!
//! **Example** - Running a command on a board already sitting at its prompt:
//! ```ignore
//! let mut session = ConsoleSession::connect(&board)?;
//! let mut runner = CommandRunner::new(&mut session, "root@master# ", timeouts);
//! let result = runner.run("ls /mnt", RunOptions::new().fail_ok())?;
//! println!("exit code: {:?}", result.exit_code);
//! ```
//!
//! All the interaction is synchronous: there is never more than one command in
//! flight on a session, and only one session can be open per board at any
//! time.

#[macro_use]
mod macros;

mod runner;
mod session;
mod transport;

pub use runner::{CommandResult, CommandRunner, NetworkCommandRunner, RunOptions};
pub(crate) use runner::{literal, literal_pattern, IP_PATTERN};
pub use session::{Captures, ConsoleSession, Outcome};
pub use transport::{Incoming, SerialTransport, SpawnedTransport, Transport};
