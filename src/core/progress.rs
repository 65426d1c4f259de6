use crate::types::{PercentileError, PercentileResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Coarse progress reporting and cooperative cancellation.
///
/// Cancellation is only looked at between days and between output tiles.
pub trait ProgressMonitor {
    fn begin_task(&mut self, name: &str, total_work: usize);

    fn worked(&mut self, work: usize);

    fn done(&mut self);

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Fail with [`PercentileError::Cancelled`] once the monitor was cancelled
pub fn check_cancelled(monitor: &dyn ProgressMonitor) -> PercentileResult<()> {
    if monitor.is_cancelled() {
        log::warn!("Processing cancelled");
        return Err(PercentileError::Cancelled);
    }
    Ok(())
}

/// Ignores all progress
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressMonitor for NullProgress {
    fn begin_task(&mut self, _name: &str, _total_work: usize) {}

    fn worked(&mut self, _work: usize) {}

    fn done(&mut self) {}
}

/// Logs progress in steps of whole percents
#[derive(Debug, Default)]
pub struct LogProgress {
    task: String,
    total: usize,
    current: usize,
    last_percent: usize,
    report_every: usize,
    cancel: Option<Arc<AtomicBool>>,
}

impl LogProgress {
    /// Report every 10 percent
    pub fn new() -> Self {
        Self::with_step(10)
    }

    pub fn with_step(percent_step: usize) -> Self {
        Self {
            report_every: percent_step.clamp(1, 100),
            ..Self::default()
        }
    }

    /// Cancel the run once `flag` is set
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }
}

impl ProgressMonitor for LogProgress {
    fn begin_task(&mut self, name: &str, total_work: usize) {
        self.task = name.to_string();
        self.total = total_work;
        self.current = 0;
        self.last_percent = 0;
        log::info!("{} ({} steps)", name, total_work);
    }

    fn worked(&mut self, work: usize) {
        self.current = (self.current + work).min(self.total);
        if self.total == 0 {
            return;
        }
        let percent = self.current * 100 / self.total;
        if percent >= self.last_percent + self.report_every || (percent == 100 && self.last_percent < 100) {
            self.last_percent = percent;
            log::info!("{} progress: {}%", self.task, percent);
        }
    }

    fn done(&mut self) {
        log::info!("{} finished", self.task);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, |flag| flag.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut progress = LogProgress::new().with_cancel_flag(flag.clone());
        progress.begin_task("Computing", 4);
        progress.worked(1);
        assert!(check_cancelled(&progress).is_ok());

        flag.store(true, Ordering::Relaxed);
        assert!(matches!(check_cancelled(&progress), Err(PercentileError::Cancelled)));
        assert!(check_cancelled(&NullProgress).is_ok());
    }

    #[test]
    fn test_progress_is_clamped() {
        let mut progress = LogProgress::with_step(25);
        progress.begin_task("Tiles", 2);
        progress.worked(5);
        assert_eq!(progress.current, 2);
        assert_eq!(progress.last_percent, 100);
    }
}
