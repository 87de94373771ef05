//! Campus carpooling coordination service.
//!
//! The server side lives in [`server`]: trip lifecycle, the participation
//! state machine, trip-scoped messaging (direct and group chat), notification
//! fan-out and the realtime push transport.

pub mod server;
