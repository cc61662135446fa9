fn non_empty<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required<F>(lookup: &F, name: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    non_empty(lookup, name).ok_or(ConfigError::Missing(name))
}

fn read_u64<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    non_empty(lookup, name)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool<F>(lookup: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    non_empty(lookup, name)
        .map(|value| {
            matches!(
                value.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

fn read_path<F>(lookup: &F, name: &str, home: Option<&Path>) -> Result<Option<PathBuf>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = non_empty(lookup, name) else {
        return Ok(None);
    };
    if value.starts_with('~') {
        let home = home.ok_or(ConfigError::NoHome)?;
        return Ok(Some(expand_with_home(&value, home)));
    }
    Ok(Some(PathBuf::from(value)))
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_staging_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("foldershop")
}

fn account_name(username: &str, host: &str) -> String {
    format!("{username}@{host}")
}

/// A scan is due when none has ever started or the interval has elapsed
/// since the last start.
fn is_scan_due(last_scan_at: Option<i64>, now: i64, interval: Duration) -> bool {
    match last_scan_at {
        None => true,
        Some(last) => {
            let interval = i64::try_from(interval.as_secs()).unwrap_or(i64::MAX);
            now.saturating_sub(last) >= interval
        }
    }
}

/// How often the scheduler re-checks whether a scan is due.
fn scheduler_tick(interval: Duration) -> Duration {
    interval.clamp(Duration::from_secs(1), Duration::from_secs(60))
}

fn format_timestamp(secs: i64) -> String {
    time::OffsetDateTime::from_unix_timestamp(secs)
        .ok()
        .and_then(|at| {
            at.format(&time::format_description::well_known::Rfc3339)
                .ok()
        })
        .unwrap_or_else(|| secs.to_string())
}

pub fn render_log_entry(entry: &LogEntry) -> String {
    format!("{}  {}", format_timestamp(entry.logged_at), entry.message)
}

fn render_status(status: &ScanStatus, interval: Duration, now: i64) -> String {
    let mut lines = vec![format!("phase: {}", status.phase.as_str())];
    lines.push(match status.last_scan_at {
        Some(last) => format!("last scan: {}", format_timestamp(last)),
        None => "last scan: never".to_string(),
    });
    if !is_scan_due(status.last_scan_at, now, interval) {
        if let Some(last) = status.last_scan_at {
            let next = last.saturating_add(i64::try_from(interval.as_secs()).unwrap_or(i64::MAX));
            lines.push(format!("next scan: {}", format_timestamp(next)));
        }
    } else {
        lines.push("next scan: due".to_string());
    }
    lines.push(format!("processed files: {}", status.processed_files));
    lines.push(match &status.lock {
        Some(lock) if lock.is_expired(now) => {
            format!("scan lock: expired (held by {})", lock.holder)
        }
        Some(lock) => format!(
            "scan lock: held by {} until {}",
            lock.holder,
            format_timestamp(lock.expires_at)
        ),
        None => "scan lock: free".to_string(),
    });
    lines.join("\n")
}
