//! Real-time slot reservation for a booking front end.
//!
//! Each visitor's [`client::ReservationClient`] keeps a reconciled view of a
//! (date, employee) day in a [`store::SlotStore`], fed by a periodic
//! [`transport::PollingTransport`]. Soft locks mark slots "being booked";
//! the [`booking::OptimisticBookingCoordinator`] turns a lost race into a
//! conflict with alternatives. [`backend::LocalBackend`] is the in-process
//! server side.

pub mod backend;
pub mod booking;
pub mod client;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod limits;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod store;
pub mod timer;
pub mod transport;
pub mod wire;
pub mod model;
