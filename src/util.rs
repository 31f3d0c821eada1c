use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{LazyLock, Mutex};
use std::time::{Duration, Instant};

use chrono::Local;
use regex::Regex;

pub const SECOND: u64 = 1;
pub const MINUTE: u64 = SECOND * 60;
pub const HOUR: u64 = MINUTE * 60;
pub const DAY: u64 = HOUR * 24;
pub const WEEK: u64 = DAY * 7;

// 16 KiB per read request seems optimal, and is also the
// recommended chunk size of the Bittorrent protocol
pub const CHUNK_SIZE: u32 = 16 * 1024;

// Poll interval for pause/stop observation in workers and the scheduler
pub const STATE_CHECK: Duration = Duration::from_secs(1);

/// IEC binary prefixes and their byte multipliers. Values above `EiB` do
/// not fit in a `u64`, so multipliers are kept as `f64` throughout.
pub const BINARY_PREFIXES: [(&str, f64); 9] = [
    ("B", 1.0),
    ("KiB", 1_024.0),
    ("MiB", 1_048_576.0),
    ("GiB", 1_073_741_824.0),
    ("TiB", 1_099_511_627_776.0),
    ("PiB", 1_125_899_906_842_624.0),
    ("EiB", 1_152_921_504_606_846_976.0),
    ("ZiB", 1_180_591_620_717_411_303_424.0),
    ("YiB", 1_208_925_819_614_629_174_706_176.0),
];

static SPEED_FORMAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^([0-9.]+)(B|Ki?B|Mi?B|Gi?B|Ti?B|Pi?B|Ei?B|Zi?B|Yi?B)(ps)?$")
        .expect("speed limit pattern")
});

fn prefix_multiplier(unit: &str) -> Option<f64> {
    BINARY_PREFIXES
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, mult)| *mult)
}

/// Parses a CLI speed-limit field like `55KiB` or `1.5mbps` into a
/// normalized `(quantity, binary_prefix)` pair. Unmatched input yields
/// `(0.0, "KiB")`, which downstream treats as "no limit".
pub fn parse_speed_limit(limit: &str) -> (f64, String) {
    let Some(captures) = SPEED_FORMAT.captures(limit.trim()) else {
        return (0.0, "KiB".to_string());
    };

    let speed: f64 = captures[1].parse().unwrap_or(0.0);
    let unit = captures[2].to_uppercase();

    // Normalize to the 'i'-bearing prefix, except for plain bytes
    let unit = if unit == "B" {
        unit
    } else {
        format!("{}iB", &unit[..1])
    };

    (speed, unit)
}

/// Number of bytes in a `(quantity, binary_prefix)` pair. Unknown prefixes
/// count as zero.
pub fn unit_pair_to_bytes(value: f64, unit: &str) -> u64 {
    let Some(multiplier) = prefix_multiplier(unit) else {
        return 0;
    };
    (value * multiplier) as u64
}

/// Converts a byte quantity to the most readable `(quantity, prefix)`
/// representation, or to the requested prefix when one is given.
pub fn bytes_to_unit_pair(nbytes: f64, unit: Option<&str>) -> (f64, &'static str) {
    if let Some(unit) = unit {
        if let Some((name, mult)) = BINARY_PREFIXES.iter().find(|(name, _)| *name == unit) {
            return (nbytes / *mult, *name);
        }
    }

    for window in BINARY_PREFIXES.windows(2) {
        let (name, mult) = window[0];
        let (_, next_mult) = window[1];
        if nbytes < next_mult {
            return (nbytes / mult, name);
        }
    }

    let (name, mult) = BINARY_PREFIXES[BINARY_PREFIXES.len() - 1];
    (nbytes / mult, name)
}

/// Renders a byte count with the prefix chosen by [`bytes_to_unit_pair`].
/// Plain bytes stay integral; everything larger gets two decimals.
pub fn format_bytes(value: u64) -> String {
    let (quantity, unit) = bytes_to_unit_pair(value as f64, None);
    if unit == "B" {
        format!("{value} B")
    } else {
        format!("{quantity:.2} {unit}")
    }
}

/// Readable representation of time remaining, e.g. `83` -> `1m 23s`.
pub fn seconds_to_eta_string(seconds: f64) -> String {
    let seconds = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };

    if seconds == 0 {
        "< 1s".to_string()
    } else if seconds < MINUTE {
        format!("{seconds}s")
    } else if seconds < HOUR {
        format!("{}m {}s", seconds / MINUTE, seconds % MINUTE)
    } else if seconds < DAY {
        let (hours, rest) = (seconds / HOUR, seconds % HOUR);
        format!("{}h {}m {}s", hours, rest / MINUTE, rest % MINUTE)
    } else if seconds < WEEK {
        let (days, rest) = (seconds / DAY, seconds % DAY);
        format!("{}d {}h {}m", days, rest / HOUR, rest % HOUR / MINUTE)
    } else {
        let (weeks, rest) = (seconds / WEEK, seconds % WEEK);
        format!("{}w {}d {}h", weeks, rest / DAY, rest % DAY / HOUR)
    }
}

struct StampCache {
    anchor: Instant,
    counts: HashMap<String, u32>,
}

static STAMP_CACHE: LazyLock<Mutex<StampCache>> = LazyLock::new(|| {
    Mutex::new(StampCache {
        anchor: Instant::now(),
        counts: HashMap::new(),
    })
});

/// Generates a `YYYY-MM-DDTHH.MM.SS.ffffff_N` file name. The `_N` suffix
/// keeps parallel calls within the same microsecond distinct; the counter
/// cache is dropped after 2 seconds of age, long enough that stamps cannot
/// repeat.
pub fn timestamp_name() -> String {
    let mut cache = STAMP_CACHE.lock().expect("timestamp cache poisoned");
    let stamp = Local::now().format("%Y-%m-%dT%H.%M.%S.%6f").to_string();

    let count = {
        let entry = cache.counts.entry(stamp.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    if cache.anchor.elapsed() > Duration::from_secs(2) {
        cache.anchor = Instant::now();
        cache.counts.retain(|key, _| *key == stamp);
    }

    format!("{stamp}_{count}")
}

/// Free bytes on the filesystem holding `path`, walking up to the nearest
/// existing directory. `None` when nothing along the path exists or the
/// platform offers no answer.
#[cfg(unix)]
pub fn free_disk_space(path: &Path) -> Option<u64> {
    let mut probe = Some(path);
    while let Some(current) = probe {
        let candidate = if current.as_os_str().is_empty() {
            Path::new(".")
        } else {
            current
        };
        if candidate.exists() {
            let stat = nix::sys::statvfs::statvfs(candidate).ok()?;
            return Some(stat.blocks_available() as u64 * stat.fragment_size() as u64);
        }
        if current.as_os_str().is_empty() {
            break;
        }
        probe = current.parent();
    }
    None
}

#[cfg(not(unix))]
pub fn free_disk_space(_path: &Path) -> Option<u64> {
    None
}

pub fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn speed_limit_no_match_defaults() {
        assert_eq!(parse_speed_limit("test"), (0.0, "KiB".to_string()));
    }

    #[test]
    fn speed_limit_ps_suffix_accepted() {
        assert_eq!(parse_speed_limit("55kb"), parse_speed_limit("55kbps"));
    }

    #[test]
    fn speed_limit_normalizes_prefix() {
        assert_eq!(parse_speed_limit("55kb").1, "KiB");
        assert_eq!(parse_speed_limit("55kB").1, "KiB");
        assert_eq!(parse_speed_limit("2.5GIB").1, "GiB");
    }

    #[test]
    fn speed_limit_bytes_keep_no_i() {
        assert_eq!(parse_speed_limit("55b").1, "B");
    }

    #[test]
    fn speed_limit_value_is_parsed() {
        assert_eq!(parse_speed_limit("1.5MiB").0, 1.5);
    }

    #[test]
    fn unit_pair_conversion() {
        assert_eq!(unit_pair_to_bytes(1.0, "KiB"), 1024);
        assert_eq!(unit_pair_to_bytes(2.5, "MiB"), 2_621_440);
        assert_eq!(unit_pair_to_bytes(100.0, "B"), 100);
        assert_eq!(unit_pair_to_bytes(1.0, "XiB"), 0);
    }

    #[test]
    fn bytes_to_pair_picks_readable_unit() {
        assert_eq!(bytes_to_unit_pair(1023.0, None), (1023.0, "B"));
        assert_eq!(bytes_to_unit_pair(1024.0, None), (1.0, "KiB"));
        assert_eq!(bytes_to_unit_pair(1_048_576.0, None), (1.0, "MiB"));
    }

    #[test]
    fn bytes_to_pair_honours_requested_unit() {
        assert_eq!(bytes_to_unit_pair(1024.0, Some("GiB")).1, "GiB");
    }

    #[test]
    fn eta_strings() {
        assert_eq!(seconds_to_eta_string(0.0), "< 1s");
        assert_eq!(seconds_to_eta_string(59.0), "59s");
        assert_eq!(seconds_to_eta_string(83.0), "1m 23s");
        assert_eq!(seconds_to_eta_string(3683.0), "1h 1m 23s");
    }

    #[test]
    fn format_bytes_readable() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KiB");
        assert_eq!(format_bytes(1_125_899_906_842_624), "1.00 PiB");
    }

    #[test]
    fn timestamps_are_unique_under_contention() {
        let stamps: HashSet<String> = (0..1000).map(|_| timestamp_name()).collect();
        assert_eq!(stamps.len(), 1000);
    }

    #[test]
    fn timestamp_counter_resets_after_idle() {
        let _ = timestamp_name();
        std::thread::sleep(Duration::from_millis(2200));
        // two calls: the first ages the cache out, the second starts fresh
        let _ = timestamp_name();
        std::thread::sleep(Duration::from_millis(2200));
        let stamp = timestamp_name();
        assert!(stamp.ends_with("_1"), "got {stamp}");
    }

    #[cfg(unix)]
    #[test]
    fn free_space_reports_for_existing_dir() {
        assert!(free_disk_space(Path::new("/tmp")).unwrap_or(0) > 0);
    }
}
