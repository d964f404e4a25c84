//! Owns the `dumpster` nftables table: one chain referencing two rotating
//! address sets, plus the rotation protocol that refreshes a timed block
//! without ever letting the address fall out of both sets at once.
//!
//! All mutation goes through the `nft` binary via [`tokio::process::Command`],
//! the same shell-out-and-parse-JSON shape `enforcer.rs` uses for `tc`.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

const TABLE: &str = "dumpster";
const FAMILY: &str = "inet";
const CHAIN: &str = "input";
const SET_PRIMARY: &str = "dumpster_blackhole";
const SET_ALT: &str = "dumpster_blackhole_alt";
const LOG_PREFIX: &str = "Dumpster Blackhole: ";

/// The subset of [`FirewallController`] the policy engine drives, split out
/// so tests can swap in a recording stand-in instead of shelling out to a
/// real `nft`.
#[async_trait::async_trait]
pub trait FirewallBackend: Send + Sync {
    async fn time_out(&self, ip: &str, seconds: u64) -> Result<(), FirewallError>;
    async fn block_permanent(&self, ip: &str) -> Result<(), FirewallError>;
}

#[derive(Error, Debug)]
pub enum FirewallError {
    #[error("failed to invoke nft: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse nft JSON output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("nft command `{cmd}` failed: {stderr}")]
    Nft { cmd: String, stderr: String },
}

/// Internal-only: a `SetItemExists` that the rotation protocol consumes and
/// never lets escape the controller. Callers only ever see `FirewallError`.
enum AddOutcome {
    Added,
    Exists { remaining: Option<u64> },
}

pub struct FirewallController {
    log: slog::Logger,
}

impl FirewallController {
    /// Ensures the table, chain, sets, and drop rules exist, then returns a
    /// controller ready to accept `block_permanent`/`time_out` calls.
    pub async fn new(log: slog::Logger) -> Result<FirewallController, FirewallError> {
        let controller = FirewallController { log };
        controller.ensure_initialized().await?;
        Ok(controller)
    }

    async fn ensure_initialized(&self) -> Result<(), FirewallError> {
        self.run(&["add", "table", FAMILY, TABLE]).await?;
        self.run(&[
            "add",
            "chain",
            FAMILY,
            TABLE,
            CHAIN,
            "{ type filter hook input priority 10 ; policy accept ; }",
        ])
        .await?;
        self.run(&[
            "add",
            "set",
            FAMILY,
            TABLE,
            SET_PRIMARY,
            "{ type ipv4_addr ; flags timeout ; }",
        ])
        .await?;
        self.run(&[
            "add",
            "set",
            FAMILY,
            TABLE,
            SET_ALT,
            "{ type ipv4_addr ; }",
        ])
        .await?;
        self.ensure_rule(SET_PRIMARY).await?;
        self.ensure_rule(SET_ALT).await?;
        Ok(())
    }

    async fn ensure_rule(&self, set: &str) -> Result<(), FirewallError> {
        if self.rule_exists(set).await? {
            return Ok(());
        }
        let rule = format!(
            "ip saddr @{} counter log prefix \"{}\" drop",
            set, LOG_PREFIX
        );
        self.run(&["add", "rule", FAMILY, TABLE, CHAIN, &rule])
            .await?;
        Ok(())
    }

    async fn rule_exists(&self, set: &str) -> Result<bool, FirewallError> {
        let output = tokio::process::Command::new("nft")
            .args(["-j", "list", "chain", FAMILY, TABLE, CHAIN])
            .output()
            .await?;
        if !output.status.success() {
            // Chain does not exist yet on the very first run.
            return Ok(false);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let doc: Value = serde_json::from_str(&stdout)?;
        // Quoted so "@dumpster_blackhole" can't match inside the longer
        // "@dumpster_blackhole_alt" reference.
        let needle = format!("\"@{}\"", set);
        Ok(doc_contains_rule(&doc, &needle))
    }

    /// Adds `ip` to `set`, optionally with a timeout. Fails internally with
    /// `Exists` when the element is already present and `exist_ok` is false.
    async fn add_to_set(
        &self,
        set: &str,
        ip: &str,
        timeout: Option<u64>,
        exist_ok: bool,
    ) -> Result<AddOutcome, FirewallError> {
        let existing = self.get_set_elements(set).await?;
        if let Some(remaining) = existing.get(ip) {
            if !exist_ok {
                return Ok(AddOutcome::Exists {
                    remaining: *remaining,
                });
            }
        }

        let element = match timeout {
            Some(secs) => format!("{{ {} timeout {}s }}", ip, secs),
            None => format!("{{ {} }}", ip),
        };
        self.run(&["add", "element", FAMILY, TABLE, set, &element])
            .await?;
        Ok(AddOutcome::Added)
    }

    /// Removes `ip` from `set`. Logs and returns Ok when the set or element
    /// is already absent, since removal is idempotent by contract.
    async fn remove_from_set(&self, set: &str, ip: &str) -> Result<(), FirewallError> {
        let element = format!("{{ {} }}", ip);
        let output = tokio::process::Command::new("nft")
            .args(["delete", "element", FAMILY, TABLE, set, &element])
            .output()
            .await?;
        if !output.status.success() {
            slog::warn!(
                self.log,
                "nft delete element failed, assuming already absent";
                "set" => set,
                "ip" => ip,
                "stderr" => String::from_utf8_lossy(&output.stderr).to_string(),
            );
        }
        Ok(())
    }

    /// Returns every element currently in `set`, mapped to its remaining
    /// timeout in seconds (`None` for untimed elements).
    async fn get_set_elements(&self, set: &str) -> Result<HashMap<String, Option<u64>>, FirewallError> {
        let output = tokio::process::Command::new("nft")
            .args(["-j", "list", "set", FAMILY, TABLE, set])
            .output()
            .await?;
        if !output.status.success() {
            return Ok(HashMap::new());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let doc: Value = serde_json::from_str(&stdout)?;
        Ok(parse_set_elements(&doc))
    }

    /// Installs or refreshes a timed block. If the address is already
    /// present, runs the rotation protocol so the address is never absent
    /// from both sets at once, and extends the timeout by the caller's
    /// `seconds` argument on top of the pre-existing remainder.
    pub async fn time_out(&self, ip: &str, seconds: u64) -> Result<(), FirewallError> {
        match self.add_to_set(SET_PRIMARY, ip, Some(seconds), false).await? {
            AddOutcome::Added => Ok(()),
            AddOutcome::Exists { remaining } => {
                let remaining = remaining.unwrap_or(0);
                slog::debug!(self.log, "rotating timeout"; "ip" => ip, "remaining" => remaining, "extend_by" => seconds);
                self.add_to_set(SET_ALT, ip, None, true).await?;
                self.remove_from_set(SET_PRIMARY, ip).await?;
                self.add_to_set(SET_PRIMARY, ip, Some(remaining + seconds), true)
                    .await?;
                self.remove_from_set(SET_ALT, ip).await?;
                Ok(())
            }
        }
    }

    /// Installs a permanent block, idempotently.
    pub async fn block_permanent(&self, ip: &str) -> Result<(), FirewallError> {
        self.add_to_set(SET_PRIMARY, ip, None, true).await?;
        Ok(())
    }

    async fn run(&self, args: &[&str]) -> Result<(), FirewallError> {
        let output = tokio::process::Command::new("nft").args(args).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            // "add" subcommands are idempotent in nft itself; genuine
            // failures (bad syntax, permission, missing kernel module)
            // still surface here.
            if stderr.contains("File exists") {
                return Ok(());
            }
            return Err(FirewallError::Nft {
                cmd: format!("nft {}", args.join(" ")),
                stderr,
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl FirewallBackend for FirewallController {
    async fn time_out(&self, ip: &str, seconds: u64) -> Result<(), FirewallError> {
        FirewallController::time_out(self, ip, seconds).await
    }

    async fn block_permanent(&self, ip: &str) -> Result<(), FirewallError> {
        FirewallController::block_permanent(self, ip).await
    }
}

fn doc_contains_rule(doc: &Value, needle: &str) -> bool {
    let Some(items) = doc.get("nftables").and_then(Value::as_array) else {
        return false;
    };
    for item in items {
        if let Some(rule) = item.get("rule") {
            if rule.to_string().contains(needle) {
                return true;
            }
        }
    }
    false
}

fn parse_set_elements(doc: &Value) -> HashMap<String, Option<u64>> {
    let mut out = HashMap::new();
    let Some(items) = doc.get("nftables").and_then(Value::as_array) else {
        return out;
    };
    for item in items {
        let Some(set) = item.get("set") else { continue };
        let Some(elems) = set.get("elem").and_then(Value::as_array) else {
            continue;
        };
        for elem in elems {
            match elem {
                Value::String(ip) => {
                    out.insert(ip.clone(), None);
                }
                Value::Object(_) => {
                    if let Some(inner) = elem.get("elem") {
                        if let Some(ip) = inner.get("val").and_then(Value::as_str) {
                            let expires = inner.get("expires").and_then(Value::as_u64);
                            out.insert(ip.to_string(), expires);
                        }
                    }
                }
                _ => {}
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_timed_elements() {
        let doc: Value = serde_json::from_str(
            r#"{"nftables":[
                {"set":{"family":"inet","name":"dumpster_blackhole","table":"dumpster","elem":[
                    "5.6.7.8",
                    {"elem":{"val":"1.2.3.4","expires":845}}
                ]}}
            ]}"#,
        )
        .unwrap();
        let elements = parse_set_elements(&doc);
        assert_eq!(elements.get("5.6.7.8"), Some(&None));
        assert_eq!(elements.get("1.2.3.4"), Some(&Some(845)));
    }

    #[test]
    fn empty_document_yields_no_elements() {
        let doc: Value = serde_json::from_str(r#"{"nftables":[]}"#).unwrap();
        assert!(parse_set_elements(&doc).is_empty());
    }

    #[test]
    fn detects_rule_referencing_a_set() {
        let doc: Value = serde_json::from_str(
            r#"{"nftables":[
                {"rule":{"family":"inet","table":"dumpster","chain":"input","expr":[
                    {"match":{"left":{"payload":{"field":"saddr"}},"right":"@dumpster_blackhole"}}
                ]}}
            ]}"#,
        )
        .unwrap();
        assert!(doc_contains_rule(&doc, "@dumpster_blackhole"));
        assert!(!doc_contains_rule(&doc, "@dumpster_blackhole_alt"));
    }

    #[test]
    fn quoted_needle_does_not_match_a_longer_set_name() {
        let doc: Value = serde_json::from_str(
            r#"{"nftables":[
                {"rule":{"family":"inet","table":"dumpster","chain":"input","expr":[
                    {"match":{"left":{"payload":{"field":"saddr"}},"right":"@dumpster_blackhole_alt"}}
                ]}}
            ]}"#,
        )
        .unwrap();
        assert!(doc_contains_rule(&doc, "\"@dumpster_blackhole_alt\""));
        assert!(!doc_contains_rule(&doc, "\"@dumpster_blackhole\""));
    }
}
