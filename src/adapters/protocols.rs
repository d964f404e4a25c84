use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::sync::OnceLock;

pub const DEFAULT_PROTOCOLS_FILE: &str = "/etc/protocols";

static CACHE: OnceLock<HashMap<String, String>> = OnceLock::new();

/// Protocol number → protocol name, parsed once from [`DEFAULT_PROTOCOLS_FILE`]
/// and reused for the life of the process.
pub fn protocols() -> &'static HashMap<String, String> {
    CACHE.get_or_init(|| parse_file(DEFAULT_PROTOCOLS_FILE).unwrap_or_default())
}

/// Parses a protocols-style file: comments (`#`) and blank lines skipped,
/// first whitespace-separated token is the name, second is the number.
pub fn parse_file(path: &str) -> std::io::Result<HashMap<String, String>> {
    let file = std::fs::File::open(path)?;
    let mut protocols = HashMap::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut words = line.split_whitespace();
        let (Some(name), Some(number)) = (words.next(), words.next()) else {
            continue;
        };
        protocols.insert(number.to_string(), name.to_string());
    }
    Ok(protocols)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_to_number_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("protocols");
        std::fs::write(
            &path,
            "# comment\n\ntcp    6   TCP\nudp    17  UDP\n",
        )
        .unwrap();

        let parsed = parse_file(path.to_str().unwrap()).unwrap();
        assert_eq!(parsed.get("6"), Some(&"tcp".to_string()));
        assert_eq!(parsed.get("17"), Some(&"udp".to_string()));
        assert_eq!(parsed.len(), 2);
    }
}
