// ocpp-test-utils: Shared test utilities for the CSMS suite.
//
// Provides a scripted charging station that speaks OCPP-J over a real
// WebSocket, for end-to-end tests of the station endpoint.

pub mod mock_station;

pub use mock_station::{MockStation, rejection_status};
