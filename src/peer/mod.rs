pub(crate) mod codec;
pub(crate) mod session;

pub use session::{Command, PeerQueue, PeerSession, Sender};
