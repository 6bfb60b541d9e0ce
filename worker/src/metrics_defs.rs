use shared::metrics_defs::{MetricDef, MetricType};

pub const MESSAGES_RECEIVED: MetricDef = MetricDef {
    name: "worker.messages.received",
    metric_type: MetricType::Counter,
    description: "Messages pulled from the subscription",
};

pub const MESSAGES_REJECTED: MetricDef = MetricDef {
    name: "worker.messages.rejected",
    metric_type: MetricType::Counter,
    description: "Messages nacked before batching. Tagged with reason.",
};

pub const BATCH_FLUSHED: MetricDef = MetricDef {
    name: "worker.batch.flushed",
    metric_type: MetricType::Counter,
    description: "Batches handed to the sink. Tagged with trigger.",
};

pub const BATCH_SIZE: MetricDef = MetricDef {
    name: "worker.batch.size",
    metric_type: MetricType::Histogram,
    description: "Number of events per flushed batch",
};

pub const SINK_DURATION: MetricDef = MetricDef {
    name: "worker.sink.duration",
    metric_type: MetricType::Histogram,
    description: "Sink delivery duration in seconds. Tagged with outcome.",
};

pub const FLUSHES_INFLIGHT: MetricDef = MetricDef {
    name: "worker.flushes.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of batches currently being delivered",
};

pub const QUEUE_ERRORS: MetricDef = MetricDef {
    name: "worker.queue.errors",
    metric_type: MetricType::Counter,
    description: "Failed subscription calls. Tagged with operation.",
};

pub const SALTS_CLEANED: MetricDef = MetricDef {
    name: "worker.salts.cleaned",
    metric_type: MetricType::Counter,
    description: "Expired salts removed by the cleanup sweep",
};

pub const ALL_METRICS: &[MetricDef] = &[
    MESSAGES_RECEIVED,
    MESSAGES_REJECTED,
    BATCH_FLUSHED,
    BATCH_SIZE,
    SINK_DURATION,
    FLUSHES_INFLIGHT,
    QUEUE_ERRORS,
    SALTS_CLEANED,
];
