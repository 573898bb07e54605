#[cfg(target_os = "linux")]
use std::sync::OnceLock;

use slnet_process::ProcessStats;
#[cfg(target_os = "linux")]
use tokio::time::Instant;

/// CPU and memory sampling for one pid. CPU is a delta between two samples,
/// so the first sample after [`ResourceSampler::reset`] reports 0%.
///
/// Linux reads `/proc` directly; other platforms go through `sysinfo`.
pub struct ResourceSampler {
    #[cfg(target_os = "linux")]
    last: Option<(u32, u64, Instant)>,
    #[cfg(not(target_os = "linux"))]
    system: sysinfo::System,
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self {
            #[cfg(target_os = "linux")]
            last: None,
            #[cfg(not(target_os = "linux"))]
            system: sysinfo::System::new(),
        }
    }
}

#[cfg(target_os = "linux")]
impl ResourceSampler {
    pub fn reset(&mut self) {
        self.last = None;
    }

    pub async fn sample(&mut self, pid: u32) -> Option<ProcessStats> {
        let ticks = read_proc_cpu_ticks(pid).await?;
        let rss = read_proc_rss_bytes(pid).await.unwrap_or(0);
        let now = Instant::now();

        let cpu = match self.last {
            Some((last_pid, prev_ticks, prev_at)) if last_pid == pid => {
                cpu_percent(prev_ticks, prev_at, ticks, now)
            }
            _ => 0.0,
        };
        self.last = Some((pid, ticks, now));

        Some(ProcessStats {
            cpu_percent: cpu,
            memory_mb: bytes_to_mb(rss),
        })
    }
}

#[cfg(not(target_os = "linux"))]
impl ResourceSampler {
    pub fn reset(&mut self) {
        self.system = sysinfo::System::new();
    }

    pub async fn sample(&mut self, pid: u32) -> Option<ProcessStats> {
        let pid = sysinfo::Pid::from_u32(pid);
        self.system
            .refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        let process = self.system.process(pid)?;

        // sysinfo reports 0 until it has two refreshes to compare.
        let cpu = f64::from(process.cpu_usage());
        Some(ProcessStats {
            cpu_percent: if cpu.is_finite() { round_tenths(cpu) } else { 0.0 },
            memory_mb: bytes_to_mb(process.memory()),
        })
    }
}

fn bytes_to_mb(bytes: u64) -> f64 {
    round_tenths(bytes as f64 / (1024.0 * 1024.0))
}

fn round_tenths(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[cfg(target_os = "linux")]
fn cpu_percent(prev_ticks: u64, prev_at: Instant, ticks: u64, now: Instant) -> f64 {
    let dt = now.duration_since(prev_at).as_secs_f64();
    if dt <= 0.0 {
        return 0.0;
    }
    let delta_ticks = ticks.saturating_sub(prev_ticks) as f64;
    let cpu = (delta_ticks / ticks_per_sec() as f64) / dt * 100.0;
    if cpu.is_finite() {
        round_tenths(cpu)
    } else {
        0.0
    }
}

#[cfg(target_os = "linux")]
fn ticks_per_sec() -> u64 {
    static TICKS: OnceLock<u64> = OnceLock::new();
    *TICKS.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_CLK_TCK);
        if v <= 0 { 100 } else { v as u64 }
    })
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_PAGESIZE);
        if v <= 0 { 4096 } else { v as u64 }
    })
}

#[cfg(target_os = "linux")]
async fn read_proc_cpu_ticks(pid: u32) -> Option<u64> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/stat"))
        .await
        .ok()?;
    // The command name may contain spaces; fields resume after the last ')'.
    let end = s.rfind(')')?;
    let rest = s.get((end + 2)..)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = parts.get(11)?.parse().ok()?;
    let stime: u64 = parts.get(12)?.parse().ok()?;
    Some(utime.saturating_add(stime))
}

#[cfg(target_os = "linux")]
async fn read_proc_rss_bytes(pid: u32) -> Option<u64> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/statm"))
        .await
        .ok()?;
    let mut it = s.split_whitespace();
    let _size_pages = it.next()?;
    let resident_pages: u64 = it.next()?.parse().ok()?;
    Some(resident_pages.saturating_mul(page_size()))
}
