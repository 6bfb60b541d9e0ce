use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Request duration in seconds. Tagged with status.",
};

pub const REQUESTS_INFLIGHT: MetricDef = MetricDef {
    name: "requests.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of requests currently being processed",
};

pub const AUTH_FAILURES: MetricDef = MetricDef {
    name: "auth.failures",
    metric_type: MetricType::Counter,
    description: "Requests that failed signature verification. Tagged with reason.",
};

pub const EVENTS_ACCEPTED: MetricDef = MetricDef {
    name: "events.accepted",
    metric_type: MetricType::Counter,
    description: "Events accepted and handed to the publisher",
};

pub const PUBLISH_FAILURES: MetricDef = MetricDef {
    name: "events.publish_failures",
    metric_type: MetricType::Counter,
    description: "Accepted events that could not be published to the queue",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUEST_DURATION,
    REQUESTS_INFLIGHT,
    AUTH_FAILURES,
    EVENTS_ACCEPTED,
    PUBLISH_FAILURES,
];

#[cfg(test)]
mod tests {
    use super::*;
    use shared::metrics_defs::find_duplicate;

    #[test]
    fn test_metric_names_unique() {
        assert_eq!(find_duplicate(ALL_METRICS), None);
    }
}
