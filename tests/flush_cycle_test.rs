//! End-to-end flush cycle tests.

mod common;

use common::{handle_with_collector, manual_flush_config, metrics_on_shard, CollectingConsumer};
use interval_accumulator::accumulator::{IntervalConsumer, NamespaceFilter};
use interval_accumulator::core::{MetricId, MetricType, Trace};
use interval_accumulator::interval::IntervalValue;
use pretty_assertions::assert_eq;
use std::sync::Arc;

#[test]
fn test_single_metric_on_two_shards() {
    let config = manual_flush_config(2).flush_batch_size(50).build().unwrap();
    let (handle, collector) = handle_with_collector(config);
    let metric = MetricId::parse(MetricType::LongAvg, "A").unwrap();
    let owner = metric.shard_index(2);

    for v in 1..=100 {
        assert!(handle.ingest(Trace::long(metric.clone(), v)));
    }
    let report = handle.flush_now().unwrap();

    assert_eq!(report.responded, 2);
    assert_eq!(report.intervals, 1);

    let received = collector.for_metric(&metric);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].count, 100);
    assert_eq!(
        received[0].value,
        IntervalValue::Numeric {
            min: 1,
            max: 100,
            avg: 50.5,
            total: 5050.0
        }
    );

    let stats = handle.stats().unwrap();
    assert_eq!(stats.shards[owner].last_flush_accepted, 1);
    assert_eq!(stats.shards[owner].last_window_processed, 100);
    assert_eq!(stats.shards[1 - owner].last_flush_accepted, 0);
    assert_eq!(stats.shards[1 - owner].open_intervals, 0);

    handle.shutdown();
}

#[test]
fn test_empty_flush_is_not_an_error() {
    let (handle, collector) = handle_with_collector(manual_flush_config(3).build().unwrap());

    let report = handle.flush_now().unwrap();
    assert_eq!(report.intervals, 0);
    assert_eq!(report.batches, 0);
    assert!(!report.is_partial());
    assert!(collector.intervals().is_empty());

    handle.shutdown();
}

#[test]
fn test_idle_window_reports_zero_counts() {
    let (handle, collector) = handle_with_collector(manual_flush_config(1).build().unwrap());
    let errors = MetricId::parse(MetricType::IntervalIncident, "app/errors").unwrap();

    handle.ingest(Trace::incident(errors.clone(), 2));
    handle.flush_now().unwrap();
    handle.flush_now().unwrap();

    let received = collector.for_metric(&errors);
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].value, IntervalValue::Incident { total: 2 });
    assert_eq!(received[1].count, 0);
    assert_eq!(received[1].value, IntervalValue::Incident { total: 0 });
    assert!(received[1].start >= received[0].end);

    handle.shutdown();
}

#[test]
fn test_sticky_value_carries_into_next_window() {
    let (handle, collector) = handle_with_collector(manual_flush_config(2).build().unwrap());
    let gauge = MetricId::parse(MetricType::StickyIntAvg, "pool/active").unwrap();

    for v in [4, 8] {
        handle.ingest(Trace::int(gauge.clone(), v));
    }
    handle.flush_now().unwrap();
    handle.flush_now().unwrap();

    let received = collector.for_metric(&gauge);
    assert_eq!(received.len(), 2);
    assert_eq!(received[1].count, 0);
    assert_eq!(
        received[1].value,
        IntervalValue::Numeric {
            min: 4,
            max: 8,
            avg: 6.0,
            total: 0.0
        }
    );

    handle.shutdown();
}

#[test]
fn test_batches_respect_batch_size() {
    let config = manual_flush_config(2).flush_batch_size(3).build().unwrap();
    let (handle, collector) = handle_with_collector(config);

    for i in 0..10 {
        let id = MetricId::parse(MetricType::IntervalIncident, &format!("app/e{}", i)).unwrap();
        handle.ingest(Trace::incident(id, 1));
    }
    let report = handle.flush_now().unwrap();

    assert_eq!(report.intervals, 10);
    assert!(report.batches >= 4);
    let sizes = collector.batch_sizes();
    assert_eq!(sizes.iter().sum::<usize>(), 10);
    assert!(sizes.iter().all(|&n| n <= 3));

    handle.shutdown();
}

#[test]
fn test_namespace_filtered_consumers() {
    let (handle, everything) = handle_with_collector(manual_flush_config(2).build().unwrap());
    let db_only = CollectingConsumer::new("db-only");
    handle
        .register_consumer(
            Arc::clone(&db_only) as Arc<dyn IntervalConsumer>,
            NamespaceFilter::prefix("host/db"),
        )
        .unwrap();

    let db = MetricId::parse(MetricType::LongAvg, "host/db/query-ms").unwrap();
    let web = MetricId::parse(MetricType::LongAvg, "host/web/request-ms").unwrap();
    handle.ingest(Trace::long(db.clone(), 12));
    handle.ingest(Trace::long(web.clone(), 30));
    handle.flush_now().unwrap();

    assert_eq!(everything.intervals().len(), 2);
    let filtered = db_only.intervals();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].metric_id, db);

    assert!(handle.unregister_consumer("db-only"));
    handle.ingest(Trace::long(db, 1));
    handle.flush_now().unwrap();
    assert_eq!(db_only.intervals().len(), 1);

    handle.shutdown();
}

#[test]
fn test_bad_traces_are_isolated() {
    let (handle, collector) = handle_with_collector(manual_flush_config(1).build().unwrap());
    let metric = MetricId::parse(MetricType::IntAvg, "app/threads").unwrap();

    handle.ingest(Trace::int(metric.clone(), 10));
    handle.ingest(Trace::text(metric.clone(), "ten"));
    handle.ingest(Trace::int(metric.clone(), 20));
    handle.flush_now().unwrap();

    let received = collector.for_metric(&metric);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].count, 2);
    assert_eq!(handle.stats().unwrap().failed_applies, 1);

    // The shard is still alive for the next window
    handle.ingest(Trace::int(metric.clone(), 5));
    handle.flush_now().unwrap();
    assert_eq!(collector.for_metric(&metric)[1].count, 1);

    handle.shutdown();
}

#[test]
fn test_metrics_spread_over_shards() {
    let (handle, collector) = handle_with_collector(manual_flush_config(4).build().unwrap());
    let mut expected = 0;
    for shard in 0..4 {
        for id in metrics_on_shard(MetricType::IntervalIncident, shard, 4, 3) {
            handle.ingest(Trace::incident(id, 1));
            expected += 1;
        }
    }

    handle.flush_now().unwrap();

    assert_eq!(collector.intervals().len(), expected);
    let stats = handle.stats().unwrap();
    assert!(stats.shards.iter().all(|s| s.last_flush_accepted == 3));

    handle.shutdown();
}
