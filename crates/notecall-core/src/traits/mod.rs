//! Boundaries between the scheduler and its collaborators.

pub mod clock;
pub mod delivery;
pub mod repository;

pub use clock::{Clock, ManualClock, SystemClock};
pub use delivery::DeliveryChannel;
pub use repository::NoteRepository;
