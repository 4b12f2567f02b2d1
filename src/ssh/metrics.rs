use lazy_static::lazy_static;
use prometheus::{
    opts, register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};
use prometheus_static_metric::make_static_metric;

make_static_metric! {
    pub struct ResultVec: IntCounter {
        "result" => {
            success,
            failure,
        }
    }
    pub struct KeepaliveVec: IntCounter {
        "result" => {
            ok,
            miss,
        }
    }
}

lazy_static! {
    static ref CONNECTS_VEC: IntCounterVec = register_int_counter_vec!(
        opts!(
            "connect_attempts_total",
            "Number of transport dials by result"
        ),
        &["result"]
    )
    .unwrap();
    pub static ref CONNECTS: ResultVec = ResultVec::from(&CONNECTS_VEC);
    static ref KEEPALIVES_VEC: IntCounterVec = register_int_counter_vec!(
        opts!("keepalives_total", "Number of keepalive probes by result"),
        &["result"]
    )
    .unwrap();
    pub static ref KEEPALIVES: KeepaliveVec = KeepaliveVec::from(&KEEPALIVES_VEC);
    pub static ref ACTIVE_SESSIONS: IntGauge =
        register_int_gauge!("active_sessions", "Number of live transport sessions").unwrap();
    pub static ref RECONNECTS: IntCounter = register_int_counter!(
        "reconnects_total",
        "Number of supervised reconnects that re-established a session"
    )
    .unwrap();
}
