use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 速度计算器，基于滑动窗口
#[derive(Debug, Clone)]
pub struct SpeedCalculator {
    /// (时间, 累计字节数)
    history: VecDeque<(Instant, u64)>,
    /// 历史窗口大小
    window_size: Duration,
    /// 最大历史记录数
    max_entries: usize,
}

impl SpeedCalculator {
    pub fn new(window_size: Duration) -> Self {
        Self {
            history: VecDeque::new(),
            window_size,
            max_entries: 100,
        }
    }

    /// 添加数据点
    pub fn add_sample(&mut self, at: Instant, total_bytes: u64) {
        self.history.push_back((at, total_bytes));

        // 移除过期的数据点，至少保留两个
        while self.history.len() > 2 {
            match self.history.front() {
                Some(&(time, _)) if at.duration_since(time) > self.window_size => {
                    self.history.pop_front();
                }
                _ => break,
            }
        }

        while self.history.len() > self.max_entries {
            self.history.pop_front();
        }
    }

    /// 当前速度（字节/秒）
    pub fn speed(&self) -> f64 {
        let (Some(first), Some(last)) = (self.history.front(), self.history.back()) else {
            return 0.0;
        };

        let duration = last.0.duration_since(first.0).as_secs_f64();
        let bytes = last.1.saturating_sub(first.1);

        if duration > 0.0 {
            bytes as f64 / duration
        } else {
            0.0
        }
    }
}

/// 格式化字节数
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// 格式化时长
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
