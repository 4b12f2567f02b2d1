use lazy_static::lazy_static;
use prometheus::{
    opts, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};

lazy_static! {
    pub static ref STREAM_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!(
            "tunnel_streams_total",
            "Total number of bridged streams by service"
        ),
        &["service"]
    )
    .unwrap();
    pub static ref STREAM_ACTIVE: IntGaugeVec = register_int_gauge_vec!(
        opts!(
            "tunnel_streams_active",
            "Number of active bridged streams by service"
        ),
        &["service"]
    )
    .unwrap();
    pub static ref STREAM_BYTES: IntCounterVec = register_int_counter_vec!(
        opts!(
            "tunnel_stream_bytes_total",
            "Total number of bytes bridged by service and direction"
        ),
        &["service", "direction"]
    )
    .unwrap();
    pub static ref TUNNELS_ACTIVE: IntGauge = register_int_gauge!(
        "tunnels_active",
        "Number of registered tunnels across all instances"
    )
    .unwrap();
    pub static ref TUNNEL_RECONNECTS: IntCounter = register_int_counter!(
        "tunnel_reconnects_total",
        "Number of tunnels recreated by the per-instance monitors"
    )
    .unwrap();
    pub static ref PROBE_FAILURES: IntCounter = register_int_counter!(
        "tunnel_probe_failures_total",
        "Number of health probes that marked a tunnel unhealthy"
    )
    .unwrap();
}
