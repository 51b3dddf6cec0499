//! Cuts: the accepted frontier of each (context, view, resource) and the
//! threads that keep them up to date

pub mod buffer;
pub mod database;
pub mod update;
pub mod worker;

pub use buffer::{CutState, DoubleBufferedCut, FrontCut, SlotUpdate, SwapResult};
pub use database::CutDatabase;
pub use update::{CutUpdater, CycleReport, LodDecision, LodMetric, is_hole_free};
pub use worker::CutUpdateThread;
