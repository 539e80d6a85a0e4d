mod archive;
mod clock;
mod error;
mod event;
mod matching;
mod resource;
mod state;

pub use archive::ArchiveType;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::ErrorKind;
pub use event::{Event, EventType};
pub use matching::{find_host_match, match_host_identifier, normalize_identifier, MatchKind};
pub use resource::ResourceKey;
pub use state::{ErrorContext, ResourceState, TransitionContext};
