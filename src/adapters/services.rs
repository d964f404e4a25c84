use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::sync::OnceLock;

pub const DEFAULT_SERVICES_FILE: &str = "/etc/services";

/// protocol name → (port → service name, lowercased).
pub type ServiceTable = HashMap<String, HashMap<String, String>>;

static CACHE: OnceLock<ServiceTable> = OnceLock::new();

/// Parsed once from [`DEFAULT_SERVICES_FILE`] and reused for the life of the
/// process. Consulted by [`crate::policy`] to attach a human-readable
/// service name to timeout log lines; never influences blocking decisions.
pub fn services() -> &'static ServiceTable {
    CACHE.get_or_init(|| parse_file(DEFAULT_SERVICES_FILE).unwrap_or_default())
}

/// Parses a services-style file: comments (`#`) and blank lines skipped,
/// first token is the service name, second is `port/proto`.
pub fn parse_file(path: &str) -> std::io::Result<ServiceTable> {
    let file = std::fs::File::open(path)?;
    let mut services: ServiceTable = HashMap::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut words = line.split_whitespace();
        let (Some(name), Some(port_proto)) = (words.next(), words.next()) else {
            continue;
        };
        let Some((port, proto)) = port_proto.split_once('/') else {
            continue;
        };
        services
            .entry(proto.to_string())
            .or_default()
            .insert(port.to_string(), name.to_ascii_lowercase());
    }
    Ok(services)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_port_proto_mapping_and_lowercases_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services");
        std::fs::write(
            &path,
            "# comment\n\nSSH  22/tcp\nHTTP 80/tcp\nDNS  53/udp\n",
        )
        .unwrap();

        let parsed = parse_file(path.to_str().unwrap()).unwrap();
        assert_eq!(parsed.get("tcp").unwrap().get("22"), Some(&"ssh".to_string()));
        assert_eq!(parsed.get("tcp").unwrap().get("80"), Some(&"http".to_string()));
        assert_eq!(parsed.get("udp").unwrap().get("53"), Some(&"dns".to_string()));
    }
}
