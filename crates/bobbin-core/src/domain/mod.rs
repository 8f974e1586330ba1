//! Domain model (ids, envelope, outcomes, lifecycle state, events, errors).

pub mod envelope;
pub mod errors;
pub mod events;
pub mod ids;
pub mod outcome;
pub mod state;

pub use self::envelope::JobEnvelope;
pub use self::errors::{ProtocolError, WorkerError};
pub use self::events::{Warning, WorkerEvent};
pub use self::ids::{DEFAULT_TUBE, JobId, LOWEST_PRIORITY};
pub use self::outcome::{Disposition, HandlerResult};
pub use self::state::WorkerState;
