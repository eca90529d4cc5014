use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{OrchestratorError, Result};
use crate::models::GroupId;

static IPCONF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<ip>[0-9A-Za-z.\-:]+?):(?P<count>\d+)\s+(?P<agency>\S+)\s+(?P<groups>\d+(?:\s*,\s*\d+)*)$")
        .unwrap()
});

/// One host-list entry: `IP:COUNT AGENCY GROUPS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub address: String,
    pub node_count: u16,
    pub agency: String,
    pub group_ids: BTreeSet<GroupId>,
}

pub fn parse_line(line: &str) -> Result<HostSpec> {
    let caps = IPCONF_RE.captures(line.trim()).ok_or_else(|| {
        OrchestratorError::Validation(format!(
            "malformed host entry '{line}', expected 'IP:COUNT AGENCY GROUPS'"
        ))
    })?;
    let node_count: u16 = caps["count"]
        .parse()
        .map_err(|_| OrchestratorError::Validation(format!("node count out of range in '{line}'")))?;
    if node_count == 0 {
        return Err(OrchestratorError::Validation(format!(
            "node count must be positive in '{line}'"
        )));
    }
    let group_ids = caps["groups"]
        .split(',')
        .map(|g| {
            g.trim()
                .parse::<GroupId>()
                .map_err(|_| OrchestratorError::Validation(format!("bad group id in '{line}'")))
        })
        .collect::<Result<BTreeSet<_>>>()?;

    Ok(HostSpec {
        address: caps["ip"].to_string(),
        node_count,
        agency: caps["agency"].to_string(),
        group_ids,
    })
}

/// Parse a host list, skipping blank lines and `#` comments.
pub fn parse(lines: &[String]) -> Result<Vec<HostSpec>> {
    let specs = lines
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(parse_line)
        .collect::<Result<Vec<_>>>()?;
    if specs.is_empty() {
        return Err(OrchestratorError::Validation("host list is empty".into()));
    }
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_entry() {
        let spec = parse_line("10.0.0.1:2 agencyA 1,2").unwrap();
        assert_eq!(spec.address, "10.0.0.1");
        assert_eq!(spec.node_count, 2);
        assert_eq!(spec.agency, "agencyA");
        assert_eq!(spec.group_ids, BTreeSet::from([1, 2]));
    }

    #[test]
    fn parse_tolerates_spaces_in_group_list() {
        let spec = parse_line("  node-a.local:1   agB   3 , 4 ").unwrap();
        assert_eq!(spec.address, "node-a.local");
        assert_eq!(spec.group_ids, BTreeSet::from([3, 4]));
    }

    #[test]
    fn parse_skips_comments_and_blanks() {
        let lines = vec![
            "# two hosts".to_string(),
            "".to_string(),
            "10.0.0.1:2 agencyA 1".to_string(),
            "10.0.0.2:2 agencyB 1".to_string(),
        ];
        let specs = parse(&lines).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1].agency, "agencyB");
    }

    #[test]
    fn malformed_entries_are_rejected() {
        for bad in ["10.0.0.1 agencyA 1", "10.0.0.1:0 agencyA 1", "10.0.0.1:2 agencyA", "10.0.0.1:2 agencyA x"] {
            assert!(
                matches!(parse_line(bad), Err(OrchestratorError::Validation(_))),
                "{bad}"
            );
        }
        assert!(parse(&["# only a comment".to_string()]).is_err());
    }
}
