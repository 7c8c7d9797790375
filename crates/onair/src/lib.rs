//! onair: playout core for broadcast devices.
//!
//! Turns resolved timeline snapshots into timed device commands:
//!
//! - [`resolver`] projects a resolved timeline plus layer mappings into one
//!   [`DeviceState`] per device, resolving priority conflicts.
//! - [`differ`] walks a declarative [`CommandGeneratorTree`] over the old and
//!   new states and emits ordered [`Command`]s.
//! - [`scheduler`] fires queued commands at their time on independent lanes,
//!   in burst or in-order discipline.
//! - [`session`] ties the three together per device and owns the backend
//!   [`CommandSink`].

pub mod clock;
pub mod command;
pub mod differ;
pub mod error;
pub mod primitives;
pub mod profiles;
pub mod resolver;
pub mod rundown;
pub mod scheduler;
pub mod session;
pub mod sinks;
pub mod state;
pub mod telemetry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use command::Command;
pub use differ::{CommandGeneratorTree, Diff, Gate, GeneratorInput, GeneratorNode};
pub use error::{
    DiffError, DispatchError, ResolutionError, SchedulingError, SessionError, TreeError,
};
pub use primitives::{DeviceId, EntryId, LaneId, LayerId, ObjectId, Timestamp};
pub use resolver::{
    ContentProjector, FieldWrite, FlattenProjector, Instance, Mapping, Mappings, Resolution,
    ResolvedLayer, ResolvedTimelineState, Resolver,
};
pub use rundown::{Rundown, TimelineUpdate};
pub use scheduler::{
    ChannelObserver, DispatchMode, QueuedEntry, Scheduler, SchedulerEvent, SchedulerObserver,
    SchedulerOptions, TracingObserver,
};
pub use session::{
    CommandSink, DeviceProfile, DeviceSession, DeviceStatus, SessionState, StateUpdate,
    StatusCode,
};
pub use sinks::{LoggingSink, MemorySink};
pub use state::{DeviceState, Origin, PriorState, StateHistory};
