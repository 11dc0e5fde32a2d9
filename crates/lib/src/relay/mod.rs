//! Development relay: the backend chat contract (REST history plus STOMP topics) held in memory.

mod server;
mod socket;
mod state;

pub use server::{router, run_relay};
pub use state::{ChatRepository, Published, RelayState};
