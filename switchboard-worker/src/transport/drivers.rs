//! Per-platform behavior routed through an adapter: the prompt to wait
//! for, how to disable the pager, and the error banners that mark a
//! rejected command.

use regex::Regex;

#[derive(Debug, Clone)]
pub struct DriverProfile {
    pub name: String,
    pub prompt: Regex,
    pub pager_disable: Option<String>,
    pub error_markers: Vec<&'static str>,
}

impl DriverProfile {
    /// Scan command output for a device error banner.
    pub fn find_error_marker(&self, output: &str) -> Option<&'static str> {
        self.error_markers
            .iter()
            .find(|marker| output.contains(*marker))
            .copied()
    }
}

/// Resolve a driver key to its profile. Unknown keys get a generic profile
/// rather than an error: the device may still behave, and banner detection
/// simply does not apply.
pub fn profile(name: &str) -> DriverProfile {
    match name {
        "cisco_ios" | "cisco_xe" => DriverProfile {
            name: name.to_owned(),
            prompt: Regex::new(r"(?m)[\w.\-]+[>#]\s*$").unwrap(),
            pager_disable: Some("terminal length 0".to_owned()),
            error_markers: vec![
                "% Invalid input detected",
                "% Incomplete command",
                "% Ambiguous command",
            ],
        },
        "cisco_nxos" => DriverProfile {
            name: name.to_owned(),
            prompt: Regex::new(r"(?m)[\w.\-]+#\s*$").unwrap(),
            pager_disable: Some("terminal length 0".to_owned()),
            error_markers: vec!["% Invalid command", "% Incomplete command"],
        },
        "arista_eos" => DriverProfile {
            name: name.to_owned(),
            prompt: Regex::new(r"(?m)[\w.\-]+[>#]\s*$").unwrap(),
            pager_disable: Some("terminal length 0".to_owned()),
            error_markers: vec!["% Invalid input", "% Incomplete command"],
        },
        "juniper_junos" => DriverProfile {
            name: name.to_owned(),
            prompt: Regex::new(r"(?m)[\w.\-@]+[%>#]\s*$").unwrap(),
            pager_disable: Some("set cli screen-length 0".to_owned()),
            error_markers: vec!["syntax error", "unknown command"],
        },
        "linux" => DriverProfile {
            name: name.to_owned(),
            prompt: Regex::new(r"(?m)[$#]\s*$").unwrap(),
            pager_disable: None,
            error_markers: vec![],
        },
        other => DriverProfile {
            name: other.to_owned(),
            prompt: Regex::new(r"(?m)[\w.\-@]*[$%>#]\s*$").unwrap(),
            pager_disable: None,
            error_markers: vec![],
        },
    }
}
