use super::BundleContext;
use crate::metrics::Metric;
use anyhow::Result;
use qbee_shared::config::{MetricMonitor, MetricsMonitorBundle};
use qbee_shared::report::Severity;
use std::collections::HashMap;

fn monitor_key(monitor: &MetricMonitor) -> String {
    if monitor.id.is_empty() {
        monitor.value.clone()
    } else {
        format!("{}:{}", monitor.value, monitor.id)
    }
}

/// Compare configured thresholds against the latest samples, updating the
/// service-owned trip map. Emits one WARN when a monitor first trips and
/// one INFO when it clears. A changed threshold re-arms the monitor;
/// monitors removed from the configuration are evicted.
pub(crate) fn evaluate(
    monitors: &[MetricMonitor],
    samples: &[Metric],
    trips: &mut HashMap<String, f64>,
) -> Vec<(Severity, String)> {
    let configured: std::collections::HashSet<String> =
        monitors.iter().map(monitor_key).collect();
    trips.retain(|key, _| configured.contains(key));

    let mut events = Vec::new();

    for monitor in monitors {
        let key = monitor_key(monitor);
        let sample = samples
            .iter()
            .filter(|s| s.label == monitor.value && (monitor.id.is_empty() || s.id == monitor.id))
            .max_by_key(|s| s.timestamp);
        let Some(sample) = sample else { continue };

        let tripped = sample.value >= monitor.threshold;
        if tripped {
            if trips.get(&key) != Some(&monitor.threshold) {
                trips.insert(key.clone(), monitor.threshold);
                events.push((
                    Severity::Warn,
                    format!(
                        "Metric {key} value {} exceeded threshold {}",
                        sample.value, monitor.threshold
                    ),
                ));
            }
        } else if trips.remove(&key).is_some() {
            events.push((
                Severity::Info,
                format!(
                    "Metric {key} value {} back below threshold {}",
                    sample.value, monitor.threshold
                ),
            ));
        }
    }

    events
}

pub(crate) async fn execute(
    bundle: &MetricsMonitorBundle,
    ctx: &BundleContext<'_>,
) -> Result<()> {
    let samples = ctx.service.metrics().latest()?;
    let mut trips = ctx.service.monitor_state().lock().expect("trip map poisoned");

    for (severity, text) in evaluate(&bundle.metrics, &samples, &mut trips) {
        match severity {
            Severity::Warn => ctx.reporter.warn(text),
            _ => ctx.reporter.info(text),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(value: &str, id: &str, threshold: f64) -> MetricMonitor {
        MetricMonitor {
            value: value.to_string(),
            id: id.to_string(),
            threshold,
        }
    }

    fn sample(label: &str, id: &str, value: f64, timestamp: i64) -> Metric {
        Metric {
            label: label.to_string(),
            id: id.to_string(),
            value,
            timestamp,
        }
    }

    #[test]
    fn test_first_trip_warns_once() {
        let monitors = vec![monitor("cpu:user", "", 90.0)];
        let samples = vec![sample("cpu:user", "", 95.0, 1)];
        let mut trips = HashMap::new();

        let events = evaluate(&monitors, &samples, &mut trips);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, Severity::Warn);
        assert!(events[0].1.contains("exceeded threshold 90"));

        // Still tripped: no repeated warning.
        let events = evaluate(&monitors, &samples, &mut trips);
        assert!(events.is_empty());
    }

    #[test]
    fn test_clear_emits_one_info() {
        let monitors = vec![monitor("cpu:user", "", 90.0)];
        let mut trips = HashMap::new();
        evaluate(&monitors, &[sample("cpu:user", "", 95.0, 1)], &mut trips);

        let events = evaluate(&monitors, &[sample("cpu:user", "", 50.0, 2)], &mut trips);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, Severity::Info);
        assert!(events[0].1.contains("back below threshold"));

        // Already cleared: silence.
        let events = evaluate(&monitors, &[sample("cpu:user", "", 50.0, 3)], &mut trips);
        assert!(events.is_empty());
    }

    #[test]
    fn test_changed_threshold_rearms() {
        let mut trips = HashMap::new();
        evaluate(
            &[monitor("cpu:user", "", 90.0)],
            &[sample("cpu:user", "", 95.0, 1)],
            &mut trips,
        );

        // Threshold lowered while still tripped: warn again with the new value.
        let events = evaluate(
            &[monitor("cpu:user", "", 80.0)],
            &[sample("cpu:user", "", 95.0, 2)],
            &mut trips,
        );
        assert_eq!(events.len(), 1);
        assert!(events[0].1.contains("exceeded threshold 80"));
    }

    #[test]
    fn test_removed_monitor_is_evicted() {
        let mut trips = HashMap::new();
        evaluate(
            &[monitor("cpu:user", "", 90.0)],
            &[sample("cpu:user", "", 95.0, 1)],
            &mut trips,
        );
        assert!(!trips.is_empty());

        evaluate(&[], &[], &mut trips);
        assert!(trips.is_empty());
    }

    #[test]
    fn test_id_distinguishes_instances() {
        let monitors = vec![
            monitor("filesystem:use", "/", 90.0),
            monitor("filesystem:use", "/data", 90.0),
        ];
        let samples = vec![
            sample("filesystem:use", "/", 95.0, 1),
            sample("filesystem:use", "/data", 10.0, 1),
        ];
        let mut trips = HashMap::new();

        let events = evaluate(&monitors, &samples, &mut trips);
        assert_eq!(events.len(), 1);
        assert!(events[0].1.contains("filesystem:use:/ "));
    }

    #[test]
    fn test_latest_sample_wins() {
        let monitors = vec![monitor("cpu:user", "", 90.0)];
        let samples = vec![
            sample("cpu:user", "", 95.0, 1),
            sample("cpu:user", "", 20.0, 5),
        ];
        let mut trips = HashMap::new();

        // The newer, below-threshold sample decides.
        let events = evaluate(&monitors, &samples, &mut trips);
        assert!(events.is_empty());
    }

    #[test]
    fn test_missing_sample_is_ignored() {
        let monitors = vec![monitor("cpu:user", "", 90.0)];
        let mut trips = HashMap::new();
        let events = evaluate(&monitors, &[], &mut trips);
        assert!(events.is_empty());
        assert!(trips.is_empty());
    }
}
