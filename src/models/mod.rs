pub mod capture;
pub mod session;

pub use capture::CaptureRef;
pub use session::{RecordId, StoredSession, TaskId, WorkSessionRecord, WorkerId};
