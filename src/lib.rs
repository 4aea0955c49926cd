pub mod anchor;
pub mod bus;
pub mod clock;
pub mod config;
pub mod distance;
pub mod engine;
pub mod error;
pub mod model;
pub mod replay;
pub mod scanner;
pub mod table;

pub use bus::{SubscriptionBus, SubscriptionHandle};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use distance::estimate;
pub use engine::{EngineState, IngestOutcome, PositionStatus, PositioningEngine};
pub use error::EngineError;
pub use model::{
    AnchorState, BeaconIdentity, BeaconRecord, Distance, DistanceEstimate, PositionUpdate,
    SignalSample,
};
pub use scanner::{PermissionProvider, RawEvent, Scanner};
pub use table::BeaconTable;
