//! Template index files: CSV documents mapping `(hostname, platform,
//! command)` regexes to a template filename. First match wins in file
//! order; all matching is case-insensitive.

use csv::ReaderBuilder;
use regex::RegexBuilder;
use serde::Serialize;

use super::ParserError;

#[derive(Debug, Clone, Serialize)]
pub struct IndexEntry {
    pub template: String,
    pub hostname: String,
    pub platform: String,
    pub command: String,
}

/// Parse an index document. The header is `Template, Hostname, Platform,
/// Command`; an empty Hostname defaults to `.*`.
pub fn parse_index(csv_text: &str) -> Result<Vec<IndexEntry>, ParserError> {
    let mut reader = ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(csv_text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| ParserError::Template(format!("bad index header: {}", e)))?
        .clone();
    let position = |name: &str| -> Result<usize, ParserError> {
        headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
            .ok_or_else(|| ParserError::Template(format!("index is missing a {} column", name)))
    };
    let template_at = position("Template")?;
    let hostname_at = position("Hostname")?;
    let platform_at = position("Platform")?;
    let command_at = position("Command")?;

    let mut entries = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| ParserError::Template(format!("bad index row: {}", e)))?;
        let field = |at: usize| record.get(at).unwrap_or_default().to_owned();
        let hostname = field(hostname_at);
        entries.push(IndexEntry {
            template: field(template_at),
            hostname: if hostname.is_empty() {
                ".*".to_owned()
            } else {
                hostname
            },
            platform: field(platform_at),
            command: field(command_at),
        });
    }
    Ok(entries)
}

fn full_match(pattern: &str, value: &str) -> Result<bool, ParserError> {
    let regex = RegexBuilder::new(&format!("^(?:{})$", pattern))
        .case_insensitive(true)
        .build()
        .map_err(|e| ParserError::Template(format!("bad index pattern {:?}: {}", pattern, e)))?;
    Ok(regex.is_match(value))
}

/// First entry matching `(hostname, platform, command)`, in file order.
pub fn find<'a>(
    entries: &'a [IndexEntry],
    hostname: Option<&str>,
    platform: &str,
    command: &str,
) -> Result<Option<&'a IndexEntry>, ParserError> {
    for entry in entries {
        if let Some(hostname) = hostname {
            if !full_match(&entry.hostname, hostname)? {
                continue;
            }
        }
        if full_match(&entry.platform, platform)? && full_match(&entry.command, command)? {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = "\
Template, Hostname, Platform, Command
cisco_ios_show_version.textfsm, .*, cisco_ios, sh(ow)? ver(sion)?
cisco_ios_show_ip_interface_brief.textfsm, .*, cisco_ios, sh(ow)? ip int(erface)? br(ief)?
edge_show_version.textfsm, rtr-edge.*, cisco_ios, sh(ow)? ver(sion)?
";

    #[test]
    fn first_match_wins_in_file_order() {
        let entries = parse_index(INDEX).unwrap();
        assert_eq!(entries.len(), 3);

        // Even though the edge entry also matches, the earlier row wins.
        let chosen = find(&entries, Some("rtr-edge-1"), "cisco_ios", "show version")
            .unwrap()
            .unwrap();
        assert_eq!(chosen.template, "cisco_ios_show_version.textfsm");
    }

    #[test]
    fn command_abbreviations_match_through_the_regex() {
        let entries = parse_index(INDEX).unwrap();
        let chosen = find(&entries, None, "cisco_ios", "sh ip int br")
            .unwrap()
            .unwrap();
        assert_eq!(
            chosen.template,
            "cisco_ios_show_ip_interface_brief.textfsm"
        );
    }

    #[test]
    fn matching_is_case_insensitive() {
        let entries = parse_index(INDEX).unwrap();
        let chosen = find(&entries, None, "CISCO_IOS", "SHOW VERSION")
            .unwrap()
            .unwrap();
        assert_eq!(chosen.template, "cisco_ios_show_version.textfsm");
    }

    #[test]
    fn no_match_yields_none() {
        let entries = parse_index(INDEX).unwrap();
        assert!(find(&entries, None, "juniper_junos", "show version")
            .unwrap()
            .is_none());
        assert!(find(&entries, None, "cisco_ios", "show ip route")
            .unwrap()
            .is_none());
    }

    #[test]
    fn empty_hostname_defaults_to_wildcard() {
        let entries = parse_index(
            "Template, Hostname, Platform, Command\nfoo.textfsm,, cisco_ios, show clock\n",
        )
        .unwrap();
        assert_eq!(entries[0].hostname, ".*");
    }
}
