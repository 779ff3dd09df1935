//! Progress UI (spinner) polling the orchestrator's snapshot API.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use mediafetch_core::{ItemSnapshot, Orchestrator};

/// Spawns the progress UI (spinner) when requested.
/// Returns (handle, stop) so the caller can signal stop and await the handle.
/// When `use_spinner` is false, returns (None, stop) with stop already true.
pub(crate) fn spawn_progress_ui(
    use_spinner: bool,
    orchestrator: Arc<Orchestrator>,
    total: usize,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !use_spinner {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_spinner_inner(orchestrator, total, Arc::clone(&stop));
    (Some(handle), stop)
}

fn spawn_spinner_inner(
    orchestrator: Arc<Orchestrator>,
    total: usize,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));

        while !stop.load(Ordering::SeqCst) {
            let active = orchestrator.snapshot();
            let finished = total.saturating_sub(orchestrator.outstanding());
            spinner.set_message(status_line(finished, total, &active));
            tokio::time::sleep(Duration::from_millis(120)).await;
        }

        spinner.finish_and_clear();
    })
}

/// One-line summary: overall count plus the oldest in-flight item.
fn status_line(finished: usize, total: usize, active: &[ItemSnapshot]) -> String {
    let Some(current) = active.first() else {
        return format!("[{}/{}] Waiting...", finished.min(total), total);
    };
    let bytes = match (current.bytes_transferred, current.total_bytes) {
        (Some(done), Some(size)) => format!(" {}/{}", format_bytes(done), format_bytes(size)),
        (Some(done), None) => format!(" {}", format_bytes(done)),
        _ => String::new(),
    };
    format!(
        "[{}/{}] {} {}{} ({} active)",
        finished.min(total),
        total,
        current.state,
        current.origin,
        bytes,
        active.len()
    )
}

#[allow(clippy::cast_precision_loss)]
fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use mediafetch_core::{ItemId, ItemState};

    fn snapshot(state: ItemState, transferred: Option<u64>, total: Option<u64>) -> ItemSnapshot {
        ItemSnapshot {
            id: ItemId(1),
            url: "https://cdn.example.com/a.mp4".to_string(),
            origin: "cdn.example.com".to_string(),
            state,
            retry_count: 0,
            attempts: 1,
            bytes_transferred: transferred,
            total_bytes: total,
        }
    }

    #[test]
    fn test_status_line_without_active_items() {
        assert_eq!(status_line(3, 5, &[]), "[3/5] Waiting...");
    }

    #[test]
    fn test_status_line_shows_transfer_progress() {
        let line = status_line(
            0,
            2,
            &[snapshot(ItemState::Fetching, Some(2048), Some(4096))],
        );
        assert_eq!(line, "[0/2] fetching cdn.example.com 2.0 KiB/4.0 KiB (1 active)");
    }

    #[test]
    fn test_status_line_resolving_has_no_bytes() {
        let line = status_line(1, 2, &[snapshot(ItemState::Resolving, None, None)]);
        assert_eq!(line, "[1/2] resolving cdn.example.com (1 active)");
    }

    #[test]
    fn test_format_bytes_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }
}
