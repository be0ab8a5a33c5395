pub trait Metric: Send + Sync {
    fn put(&self, value: u64);
    fn close(&self);
}

/// Discards all values
pub struct NullMetric;
impl Metric for NullMetric {
    fn put(&self, _value: u64) { }
    fn close(&self) { }
}
