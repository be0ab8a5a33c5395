use futures::channel::mpsc::{Receiver, Sender};
use futures::StreamExt;
use log::warn;
use std::sync::{Mutex, PoisonError};

pub fn create_metric_channel(metric_name: &str, metric: hdrhistogram::Histogram<u64>) -> (ChannelMetric, MetricWriter) {
    let (tx, rx) = futures::channel::mpsc::channel(40);
    (ChannelMetric { tx: Mutex::new(tx) }, MetricWriter { metric_name: metric_name.to_owned(), metric, rx })
}

enum MetricEvent {
    Closedown,
    Metric(u64),
}

pub struct MetricWriter {
    metric_name: String,
    metric: hdrhistogram::Histogram<u64>,
    rx: Receiver<MetricEvent>,
}
impl MetricWriter {
    /// Record values until the metric is closed, then print the histogram.
    pub async fn consume(mut self) {
        while let Some(item) = self.rx.next().await {
            match item {
                MetricEvent::Closedown => {
                    self.rx.close();
                    break;
                },
                MetricEvent::Metric(val) => {
                    if let Err(e) = self.metric.record(val) {
                        warn!("couldn't add metric value {} to histogram: {}", val, e);
                    }
                },
            }
        }
        self.dump();
    }

    fn dump(&self) {
        if let Some(max) = self.metric.iter_all().map(|val| val.count_at_value() ).max() {
            let count = self.metric.len();
            println!("Metric {}, {} samples, {} max", self.metric_name, count, max);
            if max > 0 {
                let mut val = 0;
                for i in self.metric.iter_all() {
                    let bar_size = i.count_at_value() * 50 / max;
                    println!("{:>7} {} {}", i.value_iterated_to(), "#".repeat(bar_size as usize), i.count_at_value());
                    val += i.count_at_value();
                    if val >= count {
                        break;
                    }
                }
            }
        }
    }
}

/// Feeds values to a [`MetricWriter`] running on another task.
pub struct ChannelMetric {
    tx: Mutex<Sender<MetricEvent>>,
}
impl hlsproxy::metric::Metric for ChannelMetric {
    fn put(&self, value: u64) {
        let res = self.tx.lock().unwrap_or_else(PoisonError::into_inner).try_send(MetricEvent::Metric(value));
        if let Err(e) = res {
            if e.is_full() {
                warn!("Not storing metric; queue full")
            }
            if e.is_disconnected() {
                warn!("Not storing metric; writer disconnected")
            }
        }
    }

    fn close(&self) {
        let mut tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = tx.try_send(MetricEvent::Closedown) {
            if e.is_full() {
                warn!("can't tell metric channel to close down; queue full")
            }
        }
        // the writer also finishes once the channel is closed, even if Closedown didn't fit
        tx.close_channel();
    }
}
