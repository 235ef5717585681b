use std::time::{SystemTime, UNIX_EPOCH};

use mau_core::account::{Account, FileRecord, Friend, TrustState};
use mau_engine::SyncReport;

/// Formats a byte count into a human-readable string (B, KiB, MiB, GiB).
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Seconds since the Unix epoch, the unit `sync --since` takes.
pub fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

/// Prints the startup banner for `mau serve`.
pub fn print_banner(account: &Account, listen_addr: &str, advertise: bool) {
    let lan = if advertise { "advertised" } else { "hidden" };
    println!();
    println!("╔════════════════════════════════════════════════════════╗");
    println!("║                       🌱  mau  🌱                      ║");
    println!("╠════════════════════════════════════════════════════════╣");
    println!("║  Account : {:<43} ║", account.name());
    println!("║  FP      : {:<43} ║", account.fingerprint().to_string());
    println!("║  Listen  : {listen_addr:<43} ║");
    println!("║  LAN     : {lan:<43} ║");
    println!("╚════════════════════════════════════════════════════════╝");
    println!();
    println!("  Press Ctrl-C to stop.");
}

pub fn print_friends(friends: &[(Friend, TrustState)]) {
    if friends.is_empty() {
        println!("  No friends yet. Import one with `mau add-friend <file>`.");
        return;
    }
    for (friend, state) in friends {
        let mark = if *state == TrustState::Followed { "★" } else { " " };
        println!("  {mark} {}  {} <{}>", friend.fingerprint(), friend.name(), friend.email());
    }
}

pub fn print_files(records: &[FileRecord]) {
    if records.is_empty() {
        println!("  No files.");
        return;
    }
    for record in records {
        println!(
            "  {:>12}  {:>10}  {}",
            format_size(record.size),
            unix_secs(record.modified_at),
            record.name
        );
    }
}

pub fn print_report(report: &SyncReport) {
    println!("  ✅ Synced from {} at {}", report.friend, report.address);
    for file in &report.stored {
        println!("  📥 {} ({})", file.name, format_size(file.size));
    }
    if report.skipped > 0 {
        println!("  {} file(s) not shared with you", report.skipped);
    }
    for failure in &report.failures {
        println!("  ⚠ {}: {}", failure.name, failure.error);
    }
    if let Some(watermark) = report.watermark {
        println!("  Next time: --since {}", unix_secs(watermark));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn when_formatting_sizes_expect_binary_units() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.50 KiB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MiB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GiB");
    }

    #[test]
    fn when_converting_times_expect_whole_seconds_and_zero_before_epoch() {
        assert_eq!(unix_secs(UNIX_EPOCH + Duration::from_millis(42_900)), 42);
        assert_eq!(unix_secs(UNIX_EPOCH - Duration::from_secs(1)), 0);
    }
}
