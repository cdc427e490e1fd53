//! podgrid-core — shared configuration for the podgrid workspace.

pub mod config;

pub use config::{
    ConfigError, ConfigResult, PodgridConfig, ProviderConfig, ReadinessConfig, RetentionConfig,
    SchedulerConfig, SweepPolicy, WorkloadTypeConfig, parse_duration,
};
