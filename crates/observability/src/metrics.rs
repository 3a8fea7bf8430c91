//! Broker 指标收集模块
//!
//! 记录订阅、分发、通道与 flush 相关的运行指标。

use metrics::{counter, gauge, histogram};

/// 记录传感器硬件启停
pub fn record_sensor_enabled(sensor_id: i32, enabled: bool) {
    let action = if enabled { "enable" } else { "disable" };
    counter!(
        "sensord_sensor_toggles_total",
        "sensor_id" => sensor_id.to_string(),
        "action" => action
    )
    .increment(1);
}

/// 记录当前处于硬件启用状态的传感器数量
pub fn record_active_sensors(count: usize) {
    gauge!("sensord_active_sensors").set(count as f64);
}

/// 记录一次事件分发
///
/// `fan_out` 为本次成功写入的通道数。
pub fn record_event_dispatched(sensor_id: i32, fan_out: usize) {
    counter!(
        "sensord_events_dispatched_total",
        "sensor_id" => sensor_id.to_string()
    )
    .increment(1);
    histogram!("sensord_event_fan_out").record(fan_out as f64);
}

/// 记录分发队列已满而丢弃的数据事件
pub fn record_event_dropped(sensor_id: i32) {
    counter!(
        "sensord_events_dropped_total",
        "sensor_id" => sensor_id.to_string()
    )
    .increment(1);
}

/// 记录通道写入失败
pub fn record_channel_error(kind: &'static str) {
    counter!("sensord_channel_errors_total", "kind" => kind).increment(1);
}

/// 记录接收缓冲因帧头损坏被整体重置
pub fn record_protocol_reset() {
    counter!("sensord_protocol_resets_total").increment(1);
}

/// 记录 flush 完成
///
/// `delivered` 为 false 表示队列为空，完成事件被丢弃。
pub fn record_flush_completed(sensor_id: i32, delivered: bool) {
    let status = if delivered { "delivered" } else { "dropped" };
    counter!(
        "sensord_flush_completed_total",
        "sensor_id" => sensor_id.to_string(),
        "status" => status
    )
    .increment(1);
}

/// 分发指标聚合器
///
/// 在内存中聚合分发统计，便于退出时输出摘要。
#[derive(Debug, Clone, Default)]
pub struct DispatchAggregator {
    /// 分发事件总数
    pub total_events: u64,

    /// 无订阅者而丢弃的事件数
    pub unrouted_events: u64,

    /// 通道写入失败次数
    pub channel_errors: u64,

    /// 已送达的 flush 完成数
    pub flushes_delivered: u64,

    /// 队列为空而丢弃的 flush 完成数
    pub flushes_dropped: u64,

    /// 每个事件的扇出统计
    pub fan_out_stats: RunningStats,

    /// 各传感器事件计数
    pub per_sensor: std::collections::BTreeMap<i32, u64>,
}

impl DispatchAggregator {
    /// 创建新的聚合器
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次数据事件
    pub fn on_event(&mut self, sensor_id: i32, fan_out: usize, errors: usize) {
        self.total_events += 1;
        self.channel_errors += errors as u64;
        if fan_out == 0 && errors == 0 {
            self.unrouted_events += 1;
        }
        self.fan_out_stats.push(fan_out as f64);
        *self.per_sensor.entry(sensor_id).or_insert(0) += 1;
    }

    /// 记录一次 flush 完成
    pub fn on_flush(&mut self, delivered: bool) {
        if delivered {
            self.flushes_delivered += 1;
        } else {
            self.flushes_dropped += 1;
        }
    }

    /// 生成摘要报告
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            total_events: self.total_events,
            unrouted_events: self.unrouted_events,
            channel_errors: self.channel_errors,
            flushes_delivered: self.flushes_delivered,
            flushes_dropped: self.flushes_dropped,
            dropped_events: 0,
            fan_out: StatsSummary::from(&self.fan_out_stats),
            per_sensor: self.per_sensor.clone(),
        }
    }

    /// 重置统计
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// 指标摘要
#[derive(Debug, Clone, Default)]
pub struct MetricsSummary {
    pub total_events: u64,
    pub unrouted_events: u64,
    pub channel_errors: u64,
    pub flushes_delivered: u64,
    pub flushes_dropped: u64,
    /// 分发队列已满而丢弃的数据事件数
    pub dropped_events: u64,
    pub fan_out: StatsSummary,
    pub per_sensor: std::collections::BTreeMap<i32, u64>,
}

impl std::fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Dispatch Summary ===")?;
        writeln!(f, "Total events: {}", self.total_events)?;
        writeln!(f, "Unrouted events: {}", self.unrouted_events)?;
        writeln!(f, "Dropped on full queue: {}", self.dropped_events)?;
        writeln!(f, "Channel errors: {}", self.channel_errors)?;
        writeln!(
            f,
            "Flushes: {} delivered, {} dropped",
            self.flushes_delivered, self.flushes_dropped
        )?;
        writeln!(f, "Fan-out: {}", self.fan_out)?;

        if !self.per_sensor.is_empty() {
            writeln!(f, "Events per sensor:")?;
            for (sensor, count) in &self.per_sensor {
                writeln!(f, "  {}: {}", sensor, count)?;
            }
        }

        Ok(())
    }
}

/// 统计摘要
#[derive(Debug, Clone, Default)]
pub struct StatsSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl From<&RunningStats> for StatsSummary {
    fn from(stats: &RunningStats) -> Self {
        Self {
            count: stats.count,
            min: stats.min,
            max: stats.max,
            mean: stats.mean(),
            std_dev: stats.std_dev(),
        }
    }
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 0 {
            write!(f, "N/A")
        } else {
            write!(
                f,
                "min={:.1}, max={:.1}, mean={:.2}, std={:.2} (n={})",
                self.min, self.max, self.mean, self.std_dev, self.count
            )
        }
    }
}

/// 在线统计计算器 (Welford's algorithm)
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    /// 添加新值
    pub fn push(&mut self, value: f64) {
        self.count += 1;

        if self.count == 1 {
            self.min = value;
            self.max = value;
            self.mean = value;
            self.m2 = 0.0;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);

            let delta = value - self.mean;
            self.mean += delta / self.count as f64;
            self.m2 += delta * (value - self.mean);
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// 样本方差
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_stats() {
        let mut stats = RunningStats::default();
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            stats.push(v);
        }

        assert_eq!(stats.count(), 5);
        assert!((stats.mean() - 3.0).abs() < 1e-10);
        assert!((stats.min() - 1.0).abs() < 1e-10);
        assert!((stats.max() - 5.0).abs() < 1e-10);
        assert!((stats.variance() - 2.5).abs() < 1e-10);
    }

    #[test]
    fn test_aggregator_counts_unrouted_and_errors() {
        let mut aggregator = DispatchAggregator::new();
        aggregator.on_event(1, 3, 0);
        aggregator.on_event(1, 0, 0);
        aggregator.on_event(2, 1, 1);
        aggregator.on_flush(true);
        aggregator.on_flush(false);

        assert_eq!(aggregator.total_events, 3);
        assert_eq!(aggregator.unrouted_events, 1);
        assert_eq!(aggregator.channel_errors, 1);
        assert_eq!(aggregator.per_sensor.get(&1), Some(&2));
        assert_eq!(aggregator.flushes_dropped, 1);
    }

    #[test]
    fn test_summary_display() {
        let mut aggregator = DispatchAggregator::new();
        aggregator.on_event(5, 2, 0);
        let output = format!("{}", aggregator.summary());
        assert!(output.contains("Total events: 1"));
        assert!(output.contains("5: 1"));
    }
}
