//! Domain models shared by the pipeline and the gateway

mod evidence;
mod session;

pub use evidence::{ContentType, EvidenceItem};
pub use session::{OutcomeKind, Session, Turn};
