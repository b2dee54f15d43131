use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider, UpDownCounter},
    KeyValue,
};
use prometheus::Registry;
use std::collections::HashSet;

pub struct Metrics {
    connections_active: UpDownCounter<i64>,
    frames_counter: Counter<u64>,
    verdicts_counter: Counter<u64>,
    inference_failures: Counter<u64>,
    inference_duration: Histogram<u64>,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("hazard_relay");
        global::set_meter_provider(provider);

        let connections_active = meter
            .i64_up_down_counter("connections_active")
            .with_description("Number of open relay connections")
            .build();

        let frames_counter = meter
            .u64_counter("frames_total")
            .with_description("Inbound messages by kind")
            .build();

        let verdicts_counter = meter
            .u64_counter("verdicts_total")
            .with_description("Hazard verdicts by outcome")
            .build();

        let inference_failures = meter
            .u64_counter("inference_failures_total")
            .with_description("Failed frame analyses by error kind")
            .build();

        let boundaries = generate_boundaries((100, 500, 1500, 5000, 30000));

        let inference_duration = meter
            .u64_histogram("inference_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of the joined describe and hazard calls in milliseconds")
            .build();

        Ok(Metrics {
            connections_active,
            frames_counter,
            verdicts_counter,
            inference_failures,
            inference_duration,
            registry,
        })
    }

    pub fn record_connection_opened(&self) {
        self.connections_active.add(1, &[]);
    }

    pub fn record_connection_closed(&self) {
        self.connections_active.add(-1, &[]);
    }

    pub fn record_frame(&self, kind: &str) {
        let attributes = vec![KeyValue::new("kind", kind.to_string())];
        self.frames_counter.add(1, &attributes);
    }

    pub fn record_verdict(&self, hazardous: bool) {
        let attributes = vec![KeyValue::new("hazardous", hazardous)];
        self.verdicts_counter.add(1, &attributes);
    }

    pub fn record_inference_failure(&self, kind: &str) {
        let attributes = vec![KeyValue::new("kind", kind.to_string())];
        self.inference_failures.add(1, &attributes);
    }

    pub fn record_inference_duration(&self, duration_ms: u64) {
        self.inference_duration.record(duration_ms, &[]);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 100;
    let middle_step: usize = 250;
    let end_step: usize = 500;
    let tail_step: usize = 5000;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}
