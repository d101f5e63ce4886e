//! Pod resolver configuration.

use std::net::IpAddr;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvConf {
    pub nameservers: Vec<IpAddr>,
    pub search: Vec<String>,
}

impl ResolvConf {
    pub fn parse(content: &str) -> Self {
        let mut conf = ResolvConf::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("nameserver") => {
                    if let Some(addr) = fields.next().and_then(|a| a.parse().ok()) {
                        conf.nameservers.push(addr);
                    }
                }
                // The last search line wins, as in the resolver itself.
                Some("search") | Some("domain") => {
                    conf.search = fields.map(str::to_string).collect();
                }
                _ => {}
            }
        }

        conf
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    /// Cluster DNS suffix, e.g. `cluster.local`, derived from the
    /// `<namespace>.svc.<suffix>` search entry.
    pub fn cluster_domain(&self, namespace: &str) -> Option<&str> {
        let prefix = format!("{namespace}.svc.");
        self.search.iter().find_map(|s| s.strip_prefix(&prefix))
    }
}
