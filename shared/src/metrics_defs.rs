//! Common types for metrics definitions.
//!
//! Every crate declares its metrics as `MetricDef` constants in its own
//! `metrics_defs` module and lists them in `ALL_METRICS`. Emission goes through
//! the macros below so the name always comes from the definition.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "Counter",
            MetricType::Gauge => "Gauge",
            MetricType::Histogram => "Histogram",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub description: &'static str,
}

#[macro_export]
macro_rules! counter {
    ($def:expr) => {
        metrics::counter!($def.name)
    };
    ($def:expr, $($labels:tt)+) => {
        metrics::counter!($def.name, $($labels)+)
    };
}

#[macro_export]
macro_rules! gauge {
    ($def:expr) => {
        metrics::gauge!($def.name)
    };
    ($def:expr, $($labels:tt)+) => {
        metrics::gauge!($def.name, $($labels)+)
    };
}

#[macro_export]
macro_rules! histogram {
    ($def:expr) => {
        metrics::histogram!($def.name)
    };
    ($def:expr, $($labels:tt)+) => {
        metrics::histogram!($def.name, $($labels)+)
    };
}

/// Checks a crate's metric list for duplicate names.
pub fn find_duplicate(defs: &[MetricDef]) -> Option<&'static str> {
    defs.iter().enumerate().find_map(|(i, def)| {
        defs[i + 1..]
            .iter()
            .any(|other| other.name == def.name)
            .then_some(def.name)
    })
}
