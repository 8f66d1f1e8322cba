//! Metrics definitions for the config map loader.

use shared::metrics_defs::{MetricDef, MetricType};

pub const WATCHER_SETUP: MetricDef = MetricDef {
    name: "configmap.watcher.setup",
    metric_type: MetricType::Counter,
    description: "Watcher strategy chosen at startup. Tagged with strategy (pubsub, poll).",
};

pub const PUBSUB_RECEIVE_ERROR: MetricDef = MetricDef {
    name: "configmap.pubsub.receive_error",
    metric_type: MetricType::Counter,
    description: "Number of failed pulls on the config map subscription",
};

pub const LOAD_DURATION: MetricDef = MetricDef {
    name: "configmap.load.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete a config map load in seconds. Tagged with result.",
};

pub const RUNTIMES_RELOADED: MetricDef = MetricDef {
    name: "configmap.runtimes.reloaded",
    metric_type: MetricType::Counter,
    description: "Number of runtimes whose configs were reloaded",
};

pub const RUNTIMES_DELETED: MetricDef = MetricDef {
    name: "configmap.runtimes.deleted",
    metric_type: MetricType::Counter,
    description: "Number of runtimes removed from the store",
};

pub const DESCRIPTORS_DROPPED: MetricDef = MetricDef {
    name: "configmap.descriptors.dropped",
    metric_type: MetricType::Counter,
    description: "Descriptors skipped by validation. Tagged with reason.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    WATCHER_SETUP,
    PUBSUB_RECEIVE_ERROR,
    LOAD_DURATION,
    RUNTIMES_RELOADED,
    RUNTIMES_DELETED,
    DESCRIPTORS_DROPPED,
];
