use std::fmt;
use std::time::Duration;

/// 一次重建的结果（可观测信号）
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// 新一代编号
    pub generation: u64,
    /// 被替换掉的旧一代（首次构建为 None）
    pub replaced: Option<u64>,
    /// 拉取到的主记录数
    pub primary_records: usize,
    /// 拉取到的历史记录数
    pub historical_records: usize,
    /// 成功写入的文档数
    pub indexed: usize,
    /// Skip 策略下被跳过的记录 ID
    pub skipped: Vec<String>,
    /// 因 WorkerPool 拒绝而退化为同步执行的拉取次数
    pub degraded_fetches: usize,
    /// 提交后的文档数
    pub doc_count: u64,
    pub elapsed: Duration,
}

impl RebuildReport {
    pub fn is_degraded(&self) -> bool {
        self.degraded_fetches > 0 || !self.skipped.is_empty()
    }
}

/// SafeCache 计数器快照
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SafeCacheStats {
    /// 未过期条目数
    pub entries: usize,
    /// 当前在途计算数
    pub in_flight: usize,
    pub hits: u64,
    /// 作为 leader 执行 producer 的次数
    pub leaders: u64,
    /// 等待他人结果的次数
    pub waiters: u64,
    pub failures: u64,
    pub timeouts: u64,
    /// 池饱和导致 producer 在调用线程执行的次数
    pub inline_fallbacks: u64,
}

impl fmt::Display for RebuildReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           solitudes Rebuild Report               ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        let replaced = self
            .replaced
            .map(|g| g.to_string())
            .unwrap_or_else(|| "-".to_string());
        writeln!(
            f,
            "║ generation:     {:>10}  (replaced {:>6})    ║",
            self.generation, replaced
        )?;
        writeln!(f, "║   primary:      {:>10}                       ║", self.primary_records)?;
        writeln!(f, "║   historical:   {:>10}                       ║", self.historical_records)?;
        writeln!(f, "║   indexed:      {:>10}                       ║", self.indexed)?;
        writeln!(f, "║   skipped:      {:>10}                       ║", self.skipped.len())?;
        writeln!(f, "║   degraded:     {:>10}                       ║", self.degraded_fetches)?;
        writeln!(f, "║   doc count:    {:>10}                       ║", self.doc_count)?;
        writeln!(
            f,
            "║   elapsed:      {:>10}                       ║",
            format!("{:.2?}", self.elapsed)
        )?;
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}

impl fmt::Display for SafeCacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entries={} in_flight={} hits={} leaders={} waiters={} failures={} timeouts={} inline={}",
            self.entries,
            self.in_flight,
            self.hits,
            self.leaders,
            self.waiters,
            self.failures,
            self.timeouts,
            self.inline_fallbacks
        )
    }
}
