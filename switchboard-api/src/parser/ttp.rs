//! The hierarchical template engine: TTP-syntax templates where `{{ var }}`
//! placeholders in literal lines capture fields and `<group name="...">`
//! markers nest repeated records into arrays.

use regex::Regex;
use serde_json::{Map, Value};

use super::ParserError;

#[derive(Debug)]
struct Pattern {
    regex: Regex,
    variables: Vec<String>,
}

#[derive(Debug, Default)]
struct GroupDef {
    name: Option<String>,
    patterns: Vec<Pattern>,
    children: Vec<GroupDef>,
}

impl GroupDef {
    fn match_line(&self, line: &str) -> Option<(usize, Vec<(String, String)>)> {
        for (index, pattern) in self.patterns.iter().enumerate() {
            if let Some(captures) = pattern.regex.captures(line) {
                let mut assigned = Vec::new();
                for variable in &pattern.variables {
                    if let Some(matched) = captures.name(variable) {
                        assigned.push((variable.clone(), matched.as_str().trim().to_owned()));
                    }
                }
                return Some((index, assigned));
            }
        }
        None
    }

    fn matches_opening(&self, line: &str) -> bool {
        self.patterns
            .first()
            .is_some_and(|pattern| pattern.regex.is_match(line))
    }
}

pub struct Template {
    root: GroupDef,
}

impl Template {
    pub fn compile(source: &str) -> Result<Self, ParserError> {
        let group_open = Regex::new(r#"^<group\s+name="([\w.\-]+)"\s*>$"#).unwrap();

        let mut stack: Vec<GroupDef> = vec![GroupDef::default()];
        for (line_no, line) in source.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some(captures) = group_open.captures(trimmed) {
                stack.push(GroupDef {
                    name: Some(captures[1].to_owned()),
                    ..Default::default()
                });
                continue;
            }
            if trimmed == "</group>" {
                let finished = stack.pop().ok_or_else(|| {
                    ParserError::Template(format!("line {}: unmatched </group>", line_no + 1))
                })?;
                if finished.name.is_none() {
                    return Err(ParserError::Template(format!(
                        "line {}: unmatched </group>",
                        line_no + 1
                    )));
                }
                stack
                    .last_mut()
                    .expect("root group always present")
                    .children
                    .push(finished);
                continue;
            }
            let pattern = compile_pattern(trimmed, line_no)?;
            stack
                .last_mut()
                .expect("root group always present")
                .patterns
                .push(pattern);
        }

        match stack.len() {
            1 => Ok(Self {
                root: stack.pop().expect("just checked"),
            }),
            _ => Err(ParserError::Template("unclosed <group> block".to_owned())),
        }
    }

    /// Parse raw text into a nested structure: group records accumulate
    /// into arrays keyed by group name; top-level captures fill the root
    /// object.
    pub fn parse(&self, raw: &str) -> Result<Value, ParserError> {
        let lines: Vec<&str> = raw.lines().collect();
        let (mut records, _) = run_group(&self.root, &lines, 0, &[]);
        let record = records.pop().unwrap_or_default();
        Ok(Value::Object(record))
    }
}

fn compile_pattern(line: &str, line_no: usize) -> Result<Pattern, ParserError> {
    let placeholder = Regex::new(r"\{\{\s*(\w+)\s*\}\}").unwrap();

    let mut regex_source = String::from(r"^\s*");
    let mut variables = Vec::new();
    let mut cursor = 0usize;
    for captures in placeholder.captures_iter(line) {
        let whole = captures.get(0).expect("capture 0 always present");
        regex_source.push_str(&regex::escape(&line[cursor..whole.start()]));
        let name = captures[1].to_owned();
        regex_source.push_str(&format!("(?P<{}>.+?)", name));
        variables.push(name);
        cursor = whole.end();
    }
    regex_source.push_str(&regex::escape(&line[cursor..]));
    regex_source.push_str(r"\s*$");

    if variables.is_empty() {
        return Err(ParserError::Template(format!(
            "line {}: pattern has no {{{{ placeholders }}}}",
            line_no + 1
        )));
    }

    let regex = Regex::new(&regex_source).map_err(|e| {
        ParserError::Template(format!("line {}: bad pattern: {}", line_no + 1, e))
    })?;
    Ok(Pattern { regex, variables })
}

/// Consume lines for one group. Returns the completed records and the index
/// of the first line that belongs to an ancestor (or the end of input).
fn run_group(
    def: &GroupDef,
    lines: &[&str],
    mut index: usize,
    ancestors: &[&GroupDef],
) -> (Vec<Map<String, Value>>, usize) {
    let is_root = def.name.is_none() && ancestors.is_empty();
    let mut records: Vec<Map<String, Value>> = Vec::new();
    let mut current: Map<String, Value> = Map::new();

    while index < lines.len() {
        let line = lines[index];

        if let Some((pattern_index, assigned)) = def.match_line(line) {
            // Re-matching the opening pattern starts the next record.
            if pattern_index == 0 && !current.is_empty() {
                records.push(std::mem::take(&mut current));
            }
            for (variable, value) in assigned {
                current.insert(variable, Value::String(value));
            }
            index += 1;
            continue;
        }

        if let Some(child) = def.children.iter().find(|c| c.matches_opening(line)) {
            let mut child_ancestors = ancestors.to_vec();
            child_ancestors.push(def);
            let (child_records, next_index) = run_group(child, lines, index, &child_ancestors);
            index = next_index;
            let name = child.name.clone().expect("child groups are named");
            let mut rendered: Vec<Value> =
                child_records.into_iter().map(Value::Object).collect();
            match current.get_mut(&name) {
                Some(Value::Array(existing)) => existing.append(&mut rendered),
                _ => {
                    current.insert(name, Value::Array(rendered));
                }
            }
            continue;
        }

        if is_root {
            index += 1;
            continue;
        }

        // A line claimed by an ancestor's subtree closes this group; lines
        // claimed by nobody are noise and skipped.
        let claimed_above = ancestors.iter().any(|ancestor| {
            ancestor.match_line(line).is_some()
                || ancestor
                    .children
                    .iter()
                    .any(|sibling| !std::ptr::eq(sibling, def) && sibling.matches_opening(line))
        });
        if claimed_above {
            break;
        }
        index += 1;
    }

    if !current.is_empty() {
        records.push(current);
    }
    (records, index)
}

/// Compile and run a template in one step.
pub fn parse(template_source: &str, raw: &str) -> Result<Value, ParserError> {
    Template::compile(template_source)?.parse(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flat_placeholders_fill_the_root_object() {
        let template = "hostname {{ hostname }}\nversion {{ version }}";
        let raw = "hostname rtr1\nversion 15.2\n";
        let parsed = parse(template, raw).unwrap();
        assert_eq!(parsed, json!({"hostname": "rtr1", "version": "15.2"}));
    }

    #[test]
    fn groups_collect_repeated_records() {
        let template = r#"
<group name="interfaces">
{{ interface }} is {{ state }}, line protocol is {{ protocol }}
  Description: {{ description }}
</group>
"#;
        let raw = "\
GigabitEthernet0/0 is up, line protocol is up
  Description: uplink to core
GigabitEthernet0/1 is administratively down, line protocol is down
  Description: spare
";
        let parsed = parse(template, raw).unwrap();
        assert_eq!(
            parsed,
            json!({
                "interfaces": [
                    {
                        "interface": "GigabitEthernet0/0",
                        "state": "up",
                        "protocol": "up",
                        "description": "uplink to core"
                    },
                    {
                        "interface": "GigabitEthernet0/1",
                        "state": "administratively down",
                        "protocol": "down",
                        "description": "spare"
                    }
                ]
            })
        );
    }

    #[test]
    fn nested_groups_emit_nested_arrays() {
        let template = r#"
<group name="vrfs">
VRF {{ name }}
<group name="routes">
  route {{ prefix }} via {{ nexthop }}
</group>
</group>
"#;
        let raw = "\
VRF blue
  route 10.0.0.0/8 via 192.0.2.1
  route 10.1.0.0/16 via 192.0.2.2
VRF red
  route 172.16.0.0/12 via 198.51.100.1
";
        let parsed = parse(template, raw).unwrap();
        assert_eq!(
            parsed,
            json!({
                "vrfs": [
                    {
                        "name": "blue",
                        "routes": [
                            {"prefix": "10.0.0.0/8", "nexthop": "192.0.2.1"},
                            {"prefix": "10.1.0.0/16", "nexthop": "192.0.2.2"}
                        ]
                    },
                    {
                        "name": "red",
                        "routes": [
                            {"prefix": "172.16.0.0/12", "nexthop": "198.51.100.1"}
                        ]
                    }
                ]
            })
        );
    }

    #[test]
    fn noise_lines_are_ignored() {
        let template = r#"
<group name="neighbors">
neighbor {{ address }} remote-as {{ asn }}
</group>
"#;
        let raw = "\
some banner text
neighbor 192.0.2.1 remote-as 65001
unrelated output
neighbor 192.0.2.2 remote-as 65002
";
        let parsed = parse(template, raw).unwrap();
        let neighbors = parsed["neighbors"].as_array().unwrap();
        assert_eq!(neighbors.len(), 2);
        assert_eq!(neighbors[1]["asn"], "65002");
    }

    #[test]
    fn unbalanced_group_markers_are_template_errors() {
        assert!(matches!(
            Template::compile("<group name=\"a\">\n{{ x }}\n"),
            Err(ParserError::Template(_))
        ));
        assert!(matches!(
            Template::compile("{{ x }}\n</group>\n"),
            Err(ParserError::Template(_))
        ));
    }
}
