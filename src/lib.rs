//! Fleet Dispatch & Route Optimization Engine
//!
//! Assigns delivery orders to vehicles, sequences each vehicle's stops and
//! guarantees that every committed route finishes inside the service-level
//! window. Four automation engines keep the plan current while vehicles
//! are on the road.
//!
//! # Planning
//!
//! - [`clustering`]: Greedy and exact assignment of deliveries to vehicles
//! - [`sequencer`]: Nearest-neighbour construction with 2-opt improvement
//! - [`sla`]: Capacity allocation, proposal validation and the commit gate
//! - [`planner`]: The pipeline tying them together, with advisor distrust
//!
//! # Automation
//!
//! - **Batching**: Groups new orders by pickup and proximity
//! - **Dispatch**: Plans queued orders onto idle or planned vehicles
//! - **Route re-optimizer**: Reacts to traffic, cancellations and insertions
//! - **Escalation**: Raises alerts for routes projected to breach

pub mod advisor;
pub mod alerts;
pub mod api;
pub mod clock;
pub mod clustering;
pub mod config;
pub mod console;
pub mod demo_data;
pub mod distance;
pub mod domain;
pub mod engine;
pub mod error;
pub mod planner;
pub mod sequencer;
pub mod sla;
pub mod state;
