pub mod client;
pub mod state;
pub mod transport;

pub use client::{SubscriptionHandle, SyncClient, CONNECTION_TOPIC};
pub use state::{Action, ClientState, Event, StateMachine};
pub use transport::{Connection, Connector, Frame, WsConnector};
