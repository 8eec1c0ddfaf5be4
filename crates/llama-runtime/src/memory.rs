//! Process memory probe.

/// Resident set size of the current process in MiB.
///
/// Reads `VmRSS` from `/proc/self/status`. Returns 0 on platforms without
/// procfs or if the value cannot be parsed.
pub fn resident_memory_mb() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| parse_vm_rss_kb(&status))
        .map(|kb| kb / 1024)
        .unwrap_or(0)
}

fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vm_rss_line() {
        let status = "Name:\tllama\nVmPeak:\t  200000 kB\nVmRSS:\t  104857 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss_kb(status), Some(104857));
    }

    #[test]
    fn missing_vm_rss_is_none() {
        assert_eq!(parse_vm_rss_kb("Name:\tllama\n"), None);
    }

    #[test]
    fn probe_never_panics() {
        let _ = resident_memory_mb();
    }
}
