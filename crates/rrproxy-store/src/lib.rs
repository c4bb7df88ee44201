pub mod destination_map;
pub mod error;
pub mod matching;
pub mod mock;
pub mod mock_store;
pub mod net;
pub mod session;

pub use destination_map::DestinationMap;
pub use error::StoreError;
pub use mock::{Kind, Mock, MockSpec, Payload};
pub use matching::MatchThresholds;
pub use mock_store::MockStore;
pub use net::{DestinationEntry, NetworkAddress};
pub use session::{Mode, Session, SessionRegistry};
