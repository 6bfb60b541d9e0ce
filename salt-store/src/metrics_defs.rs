//! Metrics definitions for the salt store.

use shared::metrics_defs::{MetricDef, MetricType};

pub const SALT_CREATED: MetricDef = MetricDef {
    name: "salt.created",
    metric_type: MetricType::Counter,
    description: "Number of salts created by this process",
};

pub const SALT_CREATE_RACE_LOST: MetricDef = MetricDef {
    name: "salt.create_race_lost",
    metric_type: MetricType::Counter,
    description: "Number of salt creations that lost to a concurrent writer and re-read the winner",
};

pub const ALL_METRICS: &[MetricDef] = &[SALT_CREATED, SALT_CREATE_RACE_LOST];
