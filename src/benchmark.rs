/// Per-tick statistics, summarised once per sampling period.
#[derive(Debug, Clone)]
pub struct Benchmark {
    is_active: bool,

    total_ticks: u64,
    failed_ticks: u64,

    //ms
    period: u64,
    period_elapsed: u64,
    period_ticks: u64,
    period_total_delta: u64,
    min_delta: u64,
    max_delta: u64,

    last_summary: Option<Summary>,
}

/// One sampling period worth of frame timings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub ticks: u64,
    pub avg_fps: f64,
    pub min_delta: u64,
    pub max_delta: u64,
}

impl Benchmark {
    pub fn new(is_active: bool) -> Self {
        Self {
            is_active,
            total_ticks: 0,
            failed_ticks: 0,
            period: 1000,
            period_elapsed: 0,
            period_ticks: 0,
            period_total_delta: 0,
            min_delta: u64::MAX,
            max_delta: 0,
            last_summary: None,
        }
    }

    pub fn record_tick(&mut self, delta: u64) {
        self.total_ticks += 1;

        //周期采样
        self.period_ticks += 1;
        self.period_total_delta += delta;
        self.period_elapsed += delta;
        self.min_delta = self.min_delta.min(delta);
        self.max_delta = self.max_delta.max(delta);

        if self.period_elapsed >= self.period {
            let summary = Summary {
                ticks: self.period_ticks,
                avg_fps: self.period_ticks as f64 * 1000.0 / self.period_total_delta.max(1) as f64,
                min_delta: self.min_delta,
                max_delta: self.max_delta,
            };
            if self.is_active {
                log::info!(
                    "{:.1} fps over {} ticks (delta {}..{} ms, {} failed so far)",
                    summary.avg_fps,
                    summary.ticks,
                    summary.min_delta,
                    summary.max_delta,
                    self.failed_ticks
                );
            }
            self.last_summary = Some(summary);

            self.period_elapsed = 0;
            self.period_ticks = 0;
            self.period_total_delta = 0;
            self.min_delta = u64::MAX;
            self.max_delta = 0;
        }
    }

    pub fn record_failure(&mut self) {
        self.failed_ticks += 1;
    }

    pub fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    pub fn failed_ticks(&self) -> u64 {
        self.failed_ticks
    }

    /// The most recently completed sampling period.
    pub fn last_summary(&self) -> Option<Summary> {
        self.last_summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_after_one_second() {
        let mut benchmark = Benchmark::new(false);
        for _ in 0..9 {
            benchmark.record_tick(100);
        }
        assert!(benchmark.last_summary().is_none());

        benchmark.record_tick(100);
        let summary = benchmark.last_summary().unwrap();
        assert_eq!(summary.ticks, 10);
        assert_eq!(summary.min_delta, 100);
        assert_eq!(summary.max_delta, 100);
        assert!((summary.avg_fps - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_counts_failures() {
        let mut benchmark = Benchmark::new(true);
        benchmark.record_tick(0);
        benchmark.record_failure();
        assert_eq!(benchmark.total_ticks(), 1);
        assert_eq!(benchmark.failed_ticks(), 1);
    }
}
