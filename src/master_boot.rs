//! Booting a board into its master image.
//!
//! The master image is a minimal recovery environment booted over the
//! network. It has the board storage unmounted and a network connection,
//! which is everything needed to repartition, format and fill that storage
//! before the system under test is booted normally.
//!
//! **Example** - Driving a board to a ready shell:
//! ```ignore
//! let (mut session, result) = master_boot::factory(session, power.as_mut(), &board.master, timeouts).run();
//! let env = result?;
//! let runner = CommandRunner::new(&mut session, &board.master.prompt, timeouts);
//! ```

mod events;
mod state_machine;
mod states;

pub use state_machine::{factory, MasterBoot};
pub use states::MasterEnv;
