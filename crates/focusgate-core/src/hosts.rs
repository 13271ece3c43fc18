//! DNS blackholing through the system hosts file.
//!
//! Blocking appends `0.0.0.0 <domain>` lines; unblocking drops every line that
//! contains one of the domains as a substring. Unblocking `example.com`
//! therefore also drops an unrelated `10.0.0.5 intranet.example.com` line, so
//! callers should pass fully-qualified domains.
//!
//! The file is handled as bytes. Hosts files saved in a legacy code page are
//! not valid UTF-8, and every line that is kept is written back unchanged.

use std::{
    collections::HashSet,
    fs::{self, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;

pub const BLACKHOLE_IP: &str = "0.0.0.0";

#[derive(Debug, Error)]
pub enum HostsError {
    #[error("failed to read hosts file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write hosts file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Hosts line that blackholes `domain`.
#[must_use]
pub fn blackhole_entry(domain: &str) -> String {
    format!("{BLACKHOLE_IP} {domain}")
}

fn clean_domains<I>(urls: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    // An empty pattern would match every line on unblock.
    urls.into_iter()
        .map(|url| url.as_ref().trim().to_string())
        .filter(|url| !url.is_empty())
        .collect()
}

/// Lines of a hosts file, without the `\n` separators.
fn split_lines(contents: &[u8]) -> impl Iterator<Item = &[u8]> {
    contents.split(|byte| *byte == b'\n')
}

fn without_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

pub struct NetworkBlockGate {
    path: PathBuf,
}

impl NetworkBlockGate {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_error(&self, source: io::Error) -> HostsError {
        HostsError::Read {
            path: self.path.clone(),
            source,
        }
    }

    fn write_error(&self, source: io::Error) -> HostsError {
        HostsError::Write {
            path: self.path.clone(),
            source,
        }
    }

    /// Append a blackhole entry for every domain that lacks one.
    ///
    /// Returns the number of lines appended; a second call with the same
    /// domains appends nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the hosts file cannot be opened, read or appended to.
    pub fn block<I>(&self, urls: I) -> Result<usize, HostsError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let domains = clean_domains(urls);
        if domains.is_empty() {
            return Ok(0);
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.read_error(e))?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .map_err(|e| self.read_error(e))?;

        let present: HashSet<&[u8]> = split_lines(&contents).map(without_cr).collect();
        let mut queued = HashSet::new();
        let mut pending = String::new();
        let mut appended = 0;
        for domain in &domains {
            let entry = blackhole_entry(domain);
            if present.contains(entry.as_bytes()) || queued.contains(&entry) {
                log::debug!("Hosts entry already present: {entry}");
                continue;
            }
            log::info!("Blocking {domain} via hosts file");
            pending.push_str(&entry);
            pending.push('\n');
            queued.insert(entry);
            appended += 1;
        }

        if pending.is_empty() {
            return Ok(0);
        }
        if !contents.is_empty() && !contents.ends_with(b"\n") {
            pending.insert(0, '\n');
        }
        file.write_all(pending.as_bytes())
            .map_err(|e| self.write_error(e))?;

        Ok(appended)
    }

    /// Remove every line that mentions one of the domains.
    ///
    /// Returns the number of lines removed. The file is only rewritten when
    /// something was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the hosts file cannot be read or rewritten.
    pub fn unblock<I>(&self, urls: I) -> Result<usize, HostsError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let domains = clean_domains(urls);
        if domains.is_empty() {
            return Ok(0);
        }

        let contents = fs::read(&self.path).map_err(|e| self.read_error(e))?;
        let mut removed = 0;
        let kept: Vec<&[u8]> = split_lines(&contents)
            .filter(|line| {
                let hit = domains
                    .iter()
                    .any(|domain| contains_bytes(line, domain.as_bytes()));
                if hit {
                    removed += 1;
                    log::info!(
                        "Removing hosts entry: {}",
                        String::from_utf8_lossy(without_cr(line))
                    );
                }
                !hit
            })
            .collect();

        if removed > 0 {
            fs::write(&self.path, kept.join(&b'\n')).map_err(|e| self.write_error(e))?;
        }
        Ok(removed)
    }

    /// Whether a blackhole entry for `domain` is present.
    ///
    /// # Errors
    ///
    /// Returns an error if the hosts file cannot be read.
    pub fn is_blocked(&self, domain: &str) -> Result<bool, HostsError> {
        let entry = blackhole_entry(domain.trim());
        let contents = fs::read(&self.path).map_err(|e| self.read_error(e))?;
        let blocked = split_lines(&contents).any(|line| without_cr(line) == entry.as_bytes());
        Ok(blocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BASE: &str = "127.0.0.1 localhost\n10.0.0.5 intranet.corp\n";

    fn gate_with(contents: impl AsRef<[u8]>) -> (TempDir, NetworkBlockGate) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        fs::write(&path, contents).unwrap();
        (dir, NetworkBlockGate::new(path))
    }

    fn read(gate: &NetworkBlockGate) -> String {
        fs::read_to_string(gate.path()).unwrap()
    }

    #[test]
    fn test_block_appends_entry() {
        let (_dir, gate) = gate_with(BASE);
        assert_eq!(gate.block(["bad.example.com"]).unwrap(), 1);
        assert_eq!(read(&gate), format!("{BASE}0.0.0.0 bad.example.com\n"));
        assert!(gate.is_blocked("bad.example.com").unwrap());
    }

    #[test]
    fn test_block_is_idempotent() {
        let (_dir, gate) = gate_with(BASE);
        gate.block(["bad.example.com"]).unwrap();
        let after_first = read(&gate);

        assert_eq!(gate.block(["bad.example.com"]).unwrap(), 0);
        assert_eq!(read(&gate), after_first);
        assert_eq!(
            read(&gate)
                .lines()
                .filter(|l| *l == "0.0.0.0 bad.example.com")
                .count(),
            1
        );
    }

    #[test]
    fn test_block_dedupes_within_one_call() {
        let (_dir, gate) = gate_with(BASE);
        assert_eq!(gate.block(["a.example.com", "a.example.com"]).unwrap(), 1);
    }

    #[test]
    fn test_block_adds_missing_trailing_newline() {
        let (_dir, gate) = gate_with("127.0.0.1 localhost");
        gate.block(["bad.example.com"]).unwrap();
        assert_eq!(read(&gate), "127.0.0.1 localhost\n0.0.0.0 bad.example.com\n");
    }

    #[test]
    fn test_block_recognizes_crlf_entries() {
        let (_dir, gate) = gate_with("127.0.0.1 localhost\r\n0.0.0.0 bad.example.com\r\n");
        assert_eq!(gate.block(["bad.example.com"]).unwrap(), 0);
    }

    #[test]
    fn test_unblock_without_match_leaves_file_untouched() {
        let contents = "127.0.0.1 localhost\r\n# comment\n10.0.0.5 intranet.corp";
        let (_dir, gate) = gate_with(contents);
        assert_eq!(gate.unblock(["bad.example.com"]).unwrap(), 0);
        assert_eq!(read(&gate), contents);
    }

    #[test]
    fn test_unblock_keeps_unrelated_entries() {
        let (_dir, gate) = gate_with(BASE);
        gate.block(["bad.example.com", "worse.example.org"]).unwrap();

        assert_eq!(gate.unblock(["bad.example.com"]).unwrap(), 1);
        let contents = read(&gate);
        assert!(contents.contains("127.0.0.1 localhost"));
        assert!(contents.contains("10.0.0.5 intranet.corp"));
        assert!(contents.contains("0.0.0.0 worse.example.org"));
        assert!(!contents.contains("bad.example.com"));
    }

    #[test]
    fn test_unblock_matches_by_substring() {
        let (_dir, gate) = gate_with("10.0.0.5 intranet.example.com\n");
        gate.block(["example.com"]).unwrap();

        assert_eq!(gate.unblock(["example.com"]).unwrap(), 2);
        assert_eq!(read(&gate), "");
    }

    #[test]
    fn test_empty_domains_are_ignored() {
        let (_dir, gate) = gate_with(BASE);
        assert_eq!(gate.block(["", "  "]).unwrap(), 0);
        assert_eq!(gate.unblock([""]).unwrap(), 0);
        assert_eq!(read(&gate), BASE);
    }

    #[test]
    fn test_missing_file_reports_read_error() {
        let dir = TempDir::new().unwrap();
        let gate = NetworkBlockGate::new(dir.path().join("absent"));
        assert!(matches!(
            gate.block(["bad.example.com"]),
            Err(HostsError::Read { .. })
        ));
    }

    const LATIN1: &[u8] = b"# Configuraci\xf3n local\n127.0.0.1 localhost\n";

    #[test]
    fn test_block_tolerates_legacy_code_page() {
        let (_dir, gate) = gate_with(LATIN1);

        assert_eq!(gate.block(["bad.example.com"]).unwrap(), 1);
        assert_eq!(gate.block(["bad.example.com"]).unwrap(), 0);
        assert!(gate.is_blocked("bad.example.com").unwrap());

        let mut expected = LATIN1.to_vec();
        expected.extend_from_slice(b"0.0.0.0 bad.example.com\n");
        assert_eq!(fs::read(gate.path()).unwrap(), expected);
    }

    #[test]
    fn test_unblock_keeps_legacy_bytes_intact() {
        let mut contents = LATIN1.to_vec();
        contents.extend_from_slice(b"0.0.0.0 bad.example.com\n");
        let (_dir, gate) = gate_with(&contents);

        assert_eq!(gate.unblock(["bad.example.com"]).unwrap(), 1);
        assert_eq!(fs::read(gate.path()).unwrap(), LATIN1);
    }
}
