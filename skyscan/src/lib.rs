// THEORY:
// This file is the main entry point for the `skyscan` library crate.
// It exposes the `Detector` orchestrator and its configuration (`DetectionConfig`,
// `Action`, `Source`, ...) as the high-level interface of the engine, plus the
// building blocks (`core_modules`) for callers that want to assemble their own
// processing chain: georeferenced image sources, the sliding-window chipper,
// models, region filters, NMS and vector output.
//
// The command line front end lives in the sibling `skyscan_cli` crate and only
// talks to `pipeline::Detector`.

pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use error::{Error, Result};
pub use pipeline::{
    Action, DetectionConfig, DetectionSummary, Detector, OutputOptions, ProcessingOptions,
    RegionAction, RegionActionKind, Source, WebOptions,
};
