//! The static host table: a frozen `domain -> ip` map loaded once at
//! startup from the config file (`dnsrelay.txt` by default).
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use log::debug;

use crate::error::RelayResult;

/// IP `0.0.0.0` in the host file means "answer NXDOMAIN for this domain".
pub const BLOCKLIST_SENTINEL: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0));

#[derive(Debug, Clone)]
pub struct HostRecord {
    pub ip: IpAddr,
}

impl HostRecord {
    pub fn is_blocked(&self) -> bool {
        self.ip == BLOCKLIST_SENTINEL
    }
}

/// Frozen after [`HostTable::load`]; the dispatcher only ever reads it.
#[derive(Debug, Default)]
pub struct HostTable {
    entries: HashMap<String, HostRecord>,
}

impl HostTable {
    /// Read a newline-delimited `IP DOMAIN` file. Blank lines, `#` comments,
    /// and malformed lines (wrong field count, unparseable IP) are skipped
    /// with a debug log line rather than aborting the load. Domains are
    /// lowercased so lookups are case-insensitive per RFC 1035, unlike the
    /// case-sensitive matching this system's C ancestor used.
    pub fn load(path: impl AsRef<Path>) -> RelayResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut entries = HashMap::new();
        let mut loaded = 0usize;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(ip_field), Some(domain_field), None) =
                (fields.next(), fields.next(), fields.next())
            else {
                debug!("skipping malformed host-file line: {line:?}");
                continue;
            };
            let Ok(ip) = IpAddr::from_str(ip_field) else {
                debug!("skipping host-file line with unparseable IP: {line:?}");
                continue;
            };
            let domain = domain_field.to_ascii_lowercase();
            debug!("loaded host record: {domain} -> {ip}");
            entries.insert(domain, HostRecord { ip });
            loaded += 1;
        }

        debug!("loaded {loaded} host records from {}", path.display());
        Ok(HostTable { entries })
    }

    pub fn lookup(&self, domain: &str) -> Option<&HostRecord> {
        self.entries.get(&domain.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("dnsrelay-hosts-test-{:?}", std::thread::current().id()));
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_well_formed_lines_and_skips_junk() {
        let path = write_temp(
            "1.2.3.4 Example.COM\n\
             # a comment\n\
             \n\
             0.0.0.0 ads.test\n\
             garbage-line-with-one-field\n\
             not.an.ip also.not.valid extra.field\n",
        );
        let table = HostTable::load(&path).unwrap();
        assert_eq!(table.len(), 2);

        let rec = table.lookup("example.com").unwrap();
        assert_eq!(rec.ip, IpAddr::from_str("1.2.3.4").unwrap());
        assert!(!rec.is_blocked());

        let blocked = table.lookup("ads.test").unwrap();
        assert!(blocked.is_blocked());

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let path = write_temp("1.2.3.4 Example.com\n");
        let table = HostTable::load(&path).unwrap();
        assert!(table.lookup("EXAMPLE.COM").is_some());
        std::fs::remove_file(path).ok();
    }
}
