//! # APV Common Library
//!
//! Shared code for the AP pipeline verification tools:
//! - Measurement model (metrics, measurements, jobs)
//! - Metric registry with the built-in pipeline metrics
//! - Job file codec
//! - Stage metadata namespace
//! - Configuration loading
//! - Utility functions

pub mod config;
pub mod error;
pub mod human_time;
pub mod job_file;
pub mod measurement;
pub mod metadata;
pub mod registry;
pub mod time;

pub use error::{Error, Result};
pub use measurement::{Job, Measurement, MeasurementSet, Metric, MetricName, MetricRef, Quantity, Unit};
pub use metadata::StageMetadata;
pub use registry::MetricRegistry;
