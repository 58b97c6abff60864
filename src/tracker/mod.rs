pub mod controller;
pub mod events;
pub mod state;

pub use controller::{
    Assignment, StartOutcome, StopOutcome, TrackerController, TrackerError, TrackerServices,
};
pub use events::TrackerEvent;
pub use state::{activity_rating, format_elapsed, rating_stars, TrackingSession, TrackingStatus};
