//! The handshake state machine.
//!
//! Drives a session from a closed transport to a ready command channel:
//! open, sync with the ROM loader, optionally run the stub and sync with it,
//! identify the chip and optionally switch the link to a faster baud rate.
//! The same machine also runs the two partial sequences a ready session can
//! request: a resync with the loader and a baud rate switch.
//!
//! **Example** - Running the full handshake on a session's context:
//! ```ignore
//! use crate::handshake::{self, Plan};
//!
//! handshake::run(&mut context, Plan::Connect)?;
//! ```

#[macro_use]
mod macros;

mod events;
mod state_machine;
mod states;

pub(crate) use state_machine::{run, Context, Plan};
