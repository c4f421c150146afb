use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use ferry_transfer::settings::parse_or;
use ferry_transfer::{INITIAL_TIMEOUT, MAX_ATTEMPTS, RetryPolicy};

/// Everything the client binary reads from its environment.
#[derive(Debug)]
pub struct Settings {
    pub retry: RetryPolicy,
    pub output_dir: PathBuf,
}

impl Settings {
    pub fn load(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let initial_ms = parse_or(&var, "FERRY_INITIAL_TIMEOUT_MS", INITIAL_TIMEOUT.as_millis() as u64)?;
        let attempts = parse_or(&var, "FERRY_MAX_RETRIES", MAX_ATTEMPTS)?;
        if initial_ms == 0 {
            bail!("FERRY_INITIAL_TIMEOUT_MS must be above zero");
        }
        if attempts == 0 {
            bail!("FERRY_MAX_RETRIES must be at least 1");
        }

        Ok(Self {
            retry: RetryPolicy::new(Duration::from_millis(initial_ms), attempts),
            output_dir: var("FERRY_OUTPUT_DIR").unwrap_or_else(|| ".".into()).into(),
        })
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::load(|key| std::env::var(key).ok())
    }
}

/// Filenames from a list file: one per line, surrounding whitespace and
/// blank lines ignored.
pub fn parse_file_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

/// The address to talk to out of everything a hostname resolved to.
///
/// The server binds IPv4 by default, so the first IPv4 address wins and
/// anything else is only used when no IPv4 address exists.
pub fn pick_server_addr(addrs: impl IntoIterator<Item = SocketAddr>) -> Option<SocketAddr> {
    let mut first = None;
    for addr in addrs {
        if addr.is_ipv4() {
            return Some(addr);
        }
        first.get_or_insert(addr);
    }
    first
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_library() {
        let settings = Settings::load(|_| None).unwrap();
        assert_eq!(settings.retry, RetryPolicy::default());
        assert_eq!(settings.output_dir, PathBuf::from("."));
    }

    #[test]
    fn overrides_and_rejects() {
        let settings = Settings::load(|key| match key {
            "FERRY_INITIAL_TIMEOUT_MS" => Some("250".into()),
            "FERRY_MAX_RETRIES" => Some("7".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(settings.retry, RetryPolicy::new(Duration::from_millis(250), 7));

        assert!(Settings::load(|key| (key == "FERRY_MAX_RETRIES").then(|| "0".into())).is_err());
        assert!(Settings::load(|key| (key == "FERRY_INITIAL_TIMEOUT_MS").then(|| "soon".into())).is_err());

        let err = Settings::load(|key| (key == "FERRY_MAX_RETRIES").then(|| "x".into())).unwrap_err();
        assert!(err.to_string().contains("FERRY_MAX_RETRIES"));
    }

    #[test]
    fn localhost_prefers_ipv4() {
        let v6: SocketAddr = "[::1]:9000".parse().unwrap();
        let v4: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(pick_server_addr([v6, v4]), Some(v4));
        assert_eq!(pick_server_addr([v4, v6]), Some(v4));
        assert_eq!(pick_server_addr([v6]), Some(v6));
        assert_eq!(pick_server_addr(Vec::new()), None);
    }

    #[test]
    fn file_list_skips_blanks() {
        let list = "a.txt\n\n  b.bin  \r\n\t\nc/d.dat";
        assert_eq!(parse_file_list(list), vec!["a.txt", "b.bin", "c/d.dat"]);
    }
}
