use std::io::Write;
use std::time::Duration;

use cadence_core::dispatch::StopReason;
use cadence_core::metrics::LatencyUnit;
use cadence_driver::config::{Config, Warmup};
use cadence_driver::run::Workload;

fn load(yaml: &str) -> Config {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();

    let mut config = None;
    figment::Jail::expect_with(|_jail| {
        config = Some(Config::load(Some(file.path())).unwrap());
        Ok(())
    });
    config.unwrap()
}

#[tokio::test(start_paused = true)]
async fn configured_run_produces_report() {
    cadence_test::tracing::init();

    let config = load(
        r#"
        run:
            workers: 4
            duration: 1s
            warmup:
                operations: 10
        mix:
            reference: update
            unit: 10ms
            operations:
                - { name: update, id: 0, frequency: 1, access: insert }
                - { name: lookup, id: 1, frequency: 10 }
                - { name: scan, id: 2, frequency: 50, parameters: 1 }
        keys:
            initial_items: 100
        backend:
            latency_p50: 1ms
            latency_p99: 5ms
        measurement:
            unit: micros
        "#,
    );
    assert_eq!(config.run.warmup, Warmup::Operations(10));

    let report = Workload::new(&config).unwrap().start().finish().await;
    assert_eq!(report.stop, StopReason::Completed);
    assert_eq!(report.unit, LatencyUnit::Micros);

    let names: Vec<_> = report.kinds.iter().map(|kind| kind.name.as_str()).collect();
    assert_eq!(names, ["update", "lookup", "scan"]);

    let update = &report.kinds[0];
    let lookup = &report.kinds[1];
    let scan = &report.kinds[2];
    assert_eq!(update.interval, Duration::from_millis(10));
    assert_eq!(lookup.interval, Duration::from_millis(100));
    assert_eq!(scan.interval, Duration::from_millis(500));

    // 100 updates, 10 lookups and 2 scans fit into one second, the first 10 operations warm up.
    let total = update.counts.dispatched + lookup.counts.dispatched + scan.counts.dispatched;
    assert_eq!(total, 111);
    assert_eq!(
        update.counts.warmup + lookup.counts.warmup + scan.counts.warmup,
        10
    );

    // The scan has a single parameter set, so its second execution fails.
    assert_eq!(scan.counts.failed, 1);
    assert_eq!(update.counts.failed + lookup.counts.failed, 0);

    let latency = update.latency.unwrap();
    assert!(latency.p50 > 0);
    assert!(latency.p50 <= latency.p99);

    let keys = report.keys.unwrap();
    assert_eq!(keys.inserts, 100);
    assert_eq!(keys.items, 200);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.json");
    report.write_json(&path).unwrap();
    let json: serde_json::Value =
        serde_json::from_reader(std::fs::File::open(&path).unwrap()).unwrap();
    assert_eq!(json["stop"], "completed");
    assert_eq!(json["kinds"][1]["name"], "lookup");
    assert_eq!(json["kinds"][2]["failed"], 1);
}

#[tokio::test(start_paused = true)]
async fn disabled_operations_do_not_run() {
    let config = load(
        r#"
        run:
            duration: 500ms
        mix:
            operations:
                - { name: update, id: 0, frequency: 1, access: insert, enabled: false }
                - { name: lookup, id: 1, frequency: 10 }
        "#,
    );

    let report = Workload::new(&config).unwrap().start().finish().await;
    assert_eq!(report.kinds.len(), 1);
    assert_eq!(report.kinds[0].name, "lookup");
    assert_eq!(report.kinds[0].counts.recorded, 5);
    assert_eq!(report.keys.unwrap().inserts, 0);
}
