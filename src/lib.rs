//! Captive-portal watchdog for the campus "eportal" network: keeps track of
//! interface and reachability state and signs back in when the portal drops us.

pub mod config;
pub mod credentials;
pub mod error;
pub mod interface;
pub mod model;
pub mod portal;
pub mod reachability;
pub mod reconciler;

pub use config::Config;
pub use credentials::{Credential, CredentialStore};
pub use error::{Error, ErrorKind, Result};
pub use interface::{InterfaceProbe, SelectionPolicy, SystemInterfaceProbe};
pub use model::{Connectivity, InterfaceKind, NetworkState, OnlineStatus, ReachabilityResult};
pub use portal::{Portal, PortalClient};
pub use reachability::{PingProbe, ReachabilityProbe};
pub use reconciler::{Event, Options, Reconciler};
