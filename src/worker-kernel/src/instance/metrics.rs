//! Metric definitions and RAII guards for the instance lifecycle.

use tracing::{instrument, Level};

use crate::instance::{Instance, LoadedInstance, ProtoInstance};

// Gauges, active instances
static METRIC_ACTIVE_INSTANCES: &str = "active_instances";
static METRIC_ACTIVE_LOADED_INSTANCES: &str = "active_loaded_instances";
static METRIC_ACTIVE_PROTO_INSTANCES: &str = "active_proto_instances";

// Counters, total instances created during the lifetime of the process
static METRIC_TOTAL_INSTANCES: &str = "instances_total";
static METRIC_TOTAL_LOADED_INSTANCES: &str = "loaded_instances_total";
static METRIC_TOTAL_PROTO_INSTANCES: &str = "proto_instances_total";

// Counters, pool lease/release traffic
pub(crate) static METRIC_INSTANCE_LOADS: &str = "instance_loads_total";
pub(crate) static METRIC_INSTANCE_UNLOADS: &str = "instance_unloads_total";

// Counters, execution monitor terminations
pub(crate) static METRIC_MONITOR_TERMINATIONS: &str = "monitor_terminations_total";
pub(crate) static METRIC_MONITOR_TYPE_LABEL: &str = "monitor_type";

// Counters, total number of times handlers have been invoked
#[cfg(feature = "function_call_metrics")]
static METRIC_HANDLER_CALLS: &str = "handler_calls_total";
#[cfg(feature = "function_call_metrics")]
static METRIC_HANDLER_CALLS_WITH_GC: &str = "handler_calls_with_gc_total";
#[cfg(feature = "function_call_metrics")]
static METRIC_HANDLER_NAME: &str = "handler_name";

pub(crate) trait InstanceMetricsTrait {
    const GAUGE: &'static str;
    const COUNTER: &'static str;
}

pub(crate) struct InstanceMetricsGuard<T: InstanceMetricsTrait>(std::marker::PhantomData<T>);

#[cfg(feature = "function_call_metrics")]
pub(crate) struct HandlerCallMetricGuard<'a> {
    func_name: &'a str,
    gc: bool,
    start: std::time::Instant,
}

#[cfg(feature = "function_call_metrics")]
impl<'a> HandlerCallMetricGuard<'a> {
    #[instrument(skip_all, level = Level::DEBUG)]
    pub(crate) fn new(func_name: &'a str, gc: bool) -> Self {
        Self {
            func_name,
            gc,
            start: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "function_call_metrics")]
impl Drop for HandlerCallMetricGuard<'_> {
    #[instrument(skip_all, level = Level::DEBUG)]
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        let func_name = self.func_name.to_string();
        if self.gc {
            metrics::histogram!(METRIC_HANDLER_CALLS_WITH_GC, METRIC_HANDLER_NAME => func_name)
                .record(duration.as_micros() as f64);
        } else {
            metrics::histogram!(METRIC_HANDLER_CALLS, METRIC_HANDLER_NAME => func_name)
                .record(duration.as_micros() as f64);
        }
    }
}

impl<T: InstanceMetricsTrait> InstanceMetricsGuard<T> {
    #[instrument(skip_all, level = Level::DEBUG)]
    pub(crate) fn new() -> Self {
        metrics::gauge!(T::GAUGE).increment(1);
        metrics::counter!(T::COUNTER).increment(1);
        Self(std::marker::PhantomData)
    }
}

impl<T: InstanceMetricsTrait> Drop for InstanceMetricsGuard<T> {
    #[instrument(skip_all, level = Level::DEBUG)]
    fn drop(&mut self) {
        metrics::gauge!(T::GAUGE).decrement(1);
    }
}

impl InstanceMetricsTrait for Instance {
    const GAUGE: &'static str = METRIC_ACTIVE_INSTANCES;
    const COUNTER: &'static str = METRIC_TOTAL_INSTANCES;
}

impl InstanceMetricsTrait for LoadedInstance {
    const GAUGE: &'static str = METRIC_ACTIVE_LOADED_INSTANCES;
    const COUNTER: &'static str = METRIC_TOTAL_LOADED_INSTANCES;
}

impl InstanceMetricsTrait for ProtoInstance {
    const GAUGE: &'static str = METRIC_ACTIVE_PROTO_INSTANCES;
    const COUNTER: &'static str = METRIC_TOTAL_PROTO_INSTANCES;
}

#[cfg(test)]
mod tests {
    use crate::instance::InstanceBuilder;

    fn valid_handler() -> &'static str {
        r#"
        function handler(event) {
            event.request.uri = "/redirected.html";
            return event;
        }
        "#
    }

    fn valid_event() -> String {
        r#"{"request": {"uri": "/index.html"}}"#.to_string()
    }

    #[test]
    #[ignore = "needs to run separately to not get influenced by other tests"]
    fn metrics_recorded_across_instance_lifecycle() {
        let recorder = metrics_util::debugging::DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder.install().unwrap();

        let snapshot = {
            let proto = InstanceBuilder::new().build().unwrap();
            let mut instance = proto.load_runtime().unwrap();

            instance
                .add_handler("handler", valid_handler())
                .unwrap();

            let mut loaded = instance.into_loaded().unwrap();
            let result = loaded.handle_event("handler", valid_event(), Some(true));

            assert!(result.is_ok());
            snapshotter.snapshot()
        };

        let snapshot = snapshot.into_vec();
        if cfg!(feature = "function_call_metrics") {
            assert_eq!(snapshot.len(), 8);
        } else {
            assert_eq!(snapshot.len(), 7);
        }
    }
}
