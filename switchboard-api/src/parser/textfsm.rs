//! The row-oriented template engine: TextFSM-syntax templates with Value
//! declarations and regex state rules, emitting one flat record per
//! `Record` action.
//!
//! The supported subset covers the template library this crate bundles and
//! the overwhelming majority of community templates: Value options
//! `Required`, `Filldown` and `List`; rule actions `Record`, `Next`,
//! `Continue`, `Continue.Record`, `Error` and state transitions.

use std::collections::HashMap;

use regex::Regex;
use serde_json::{Map, Value};

use super::ParserError;

#[derive(Debug, Clone, PartialEq)]
struct ValueDef {
    name: String,
    pattern: String,
    required: bool,
    filldown: bool,
    list: bool,
}

#[derive(Debug)]
enum RuleAction {
    Record,
    Next,
    Continue,
    ContinueRecord,
    Error,
}

#[derive(Debug)]
struct Rule {
    regex: Regex,
    action: RuleAction,
    next_state: Option<String>,
}

#[derive(Debug)]
pub struct Template {
    values: Vec<ValueDef>,
    states: HashMap<String, Vec<Rule>>,
}

impl Template {
    pub fn compile(source: &str) -> Result<Self, ParserError> {
        let mut values = Vec::new();
        let mut states: HashMap<String, Vec<Rule>> = HashMap::new();
        let mut current_state: Option<String> = None;

        for (line_no, line) in source.lines().enumerate() {
            let trimmed = line.trim_end();
            if trimmed.trim_start().starts_with('#') {
                continue;
            }
            if let Some(rest) = trimmed.strip_prefix("Value ") {
                values.push(parse_value(rest, line_no)?);
                continue;
            }
            if trimmed.is_empty() {
                continue;
            }
            if !trimmed.starts_with(char::is_whitespace) {
                current_state = Some(trimmed.to_owned());
                states.entry(trimmed.to_owned()).or_default();
                continue;
            }

            let state = current_state.clone().ok_or_else(|| {
                ParserError::Template(format!("line {}: rule outside any state", line_no + 1))
            })?;
            let rule = parse_rule(trimmed.trim_start(), &values, line_no)?;
            states.get_mut(&state).expect("state was just inserted").push(rule);
        }

        if !states.contains_key("Start") {
            return Err(ParserError::Template(
                "template has no Start state".to_owned(),
            ));
        }
        Ok(Self { values, states })
    }

    /// Run the state machine over raw text, producing one record per
    /// `Record` action plus the implicit record at end of input.
    pub fn parse(&self, raw: &str) -> Result<Vec<Map<String, Value>>, ParserError> {
        let mut run = Run::new(self);
        for line in raw.lines() {
            run.feed(line)?;
        }
        run.finish();
        Ok(run.records)
    }
}

struct Run<'t> {
    template: &'t Template,
    state: String,
    row: HashMap<String, Value>,
    touched: bool,
    records: Vec<Map<String, Value>>,
}

impl<'t> Run<'t> {
    fn new(template: &'t Template) -> Self {
        Self {
            template,
            state: "Start".to_owned(),
            row: HashMap::new(),
            touched: false,
            records: Vec::new(),
        }
    }

    fn feed(&mut self, line: &str) -> Result<(), ParserError> {
        let rules = match self.template.states.get(&self.state) {
            Some(rules) => rules,
            None => return Ok(()),
        };

        let mut start_at = 0usize;
        loop {
            let mut continued = false;
            for (index, rule) in rules.iter().enumerate().skip(start_at) {
                let Some(captures) = rule.regex.captures(line) else {
                    continue;
                };
                self.apply_captures(&captures);

                match rule.action {
                    RuleAction::Error => {
                        return Err(ParserError::Parse(format!(
                            "template error state reached on line {:?}",
                            line
                        )));
                    }
                    RuleAction::Record => self.record(),
                    RuleAction::ContinueRecord => self.record(),
                    RuleAction::Next | RuleAction::Continue => {}
                }
                if let Some(next_state) = &rule.next_state {
                    self.state = next_state.clone();
                }
                if matches!(rule.action, RuleAction::Continue | RuleAction::ContinueRecord) {
                    // Keep offering this line to the remaining rules.
                    start_at = index + 1;
                    continued = true;
                    break;
                }
                return Ok(());
            }
            if !continued {
                return Ok(());
            }
        }
    }

    fn apply_captures(&mut self, captures: &regex::Captures<'_>) {
        for value in &self.template.values {
            let Some(matched) = captures.name(&value.name) else {
                continue;
            };
            self.touched = true;
            if value.list {
                match self.row.get_mut(&value.name) {
                    Some(Value::Array(items)) => {
                        items.push(Value::String(matched.as_str().to_owned()))
                    }
                    _ => {
                        self.row.insert(
                            value.name.clone(),
                            Value::Array(vec![Value::String(matched.as_str().to_owned())]),
                        );
                    }
                }
            } else {
                self.row.insert(
                    value.name.clone(),
                    Value::String(matched.as_str().to_owned()),
                );
            }
        }
    }

    fn record(&mut self) {
        let required_met = self
            .template
            .values
            .iter()
            .filter(|v| v.required)
            .all(|v| self.row.contains_key(&v.name));
        if required_met && self.touched {
            let mut record = Map::new();
            for value in &self.template.values {
                let rendered = self.row.get(&value.name).cloned().unwrap_or_else(|| {
                    if value.list {
                        Value::Array(vec![])
                    } else {
                        Value::String(String::new())
                    }
                });
                record.insert(value.name.clone(), rendered);
            }
            self.records.push(record);
        }

        // Filldown values survive into the next row; everything else clears.
        self.row
            .retain(|name, _| self.template.values.iter().any(|v| v.filldown && v.name == *name));
        self.touched = false;
    }

    fn finish(&mut self) {
        // Implicit record at end of input, mirroring TextFSM's EOF handling.
        if self.touched {
            self.record();
        }
    }
}

fn parse_value(rest: &str, line_no: usize) -> Result<ValueDef, ParserError> {
    let open = rest.find('(').ok_or_else(|| {
        ParserError::Template(format!("line {}: Value without a pattern", line_no + 1))
    })?;
    let close = rest.rfind(')').ok_or_else(|| {
        ParserError::Template(format!("line {}: unterminated Value pattern", line_no + 1))
    })?;
    let pattern = rest[open + 1..close].to_owned();

    let head: Vec<&str> = rest[..open].split_whitespace().collect();
    let (options, name) = match head.as_slice() {
        [name] => (Vec::new(), *name),
        [options @ .., name] => (options.to_vec(), *name),
        [] => {
            return Err(ParserError::Template(format!(
                "line {}: Value without a name",
                line_no + 1
            )))
        }
    };

    let mut value = ValueDef {
        name: name.to_owned(),
        pattern,
        required: false,
        filldown: false,
        list: false,
    };
    for option_group in options {
        for option in option_group.split(',') {
            match option {
                "Required" => value.required = true,
                "Filldown" => value.filldown = true,
                "List" => value.list = true,
                other => {
                    return Err(ParserError::Template(format!(
                        "line {}: unsupported Value option {}",
                        line_no + 1,
                        other
                    )))
                }
            }
        }
    }
    Ok(value)
}

fn parse_rule(line: &str, values: &[ValueDef], line_no: usize) -> Result<Rule, ParserError> {
    let (pattern_part, action_part) = match line.split_once("->") {
        Some((pattern, action)) => (pattern.trim_end(), Some(action.trim())),
        None => (line, None),
    };
    if !pattern_part.starts_with('^') {
        return Err(ParserError::Template(format!(
            "line {}: rule pattern must start with ^",
            line_no + 1
        )));
    }

    let mut pattern = pattern_part.to_owned();
    for value in values {
        pattern = pattern.replace(
            &format!("${{{}}}", value.name),
            &format!("(?P<{}>{})", value.name, value.pattern),
        );
    }
    let regex = Regex::new(&pattern).map_err(|e| {
        ParserError::Template(format!("line {}: bad rule pattern: {}", line_no + 1, e))
    })?;

    let (action, next_state) = match action_part {
        None | Some("") | Some("Next") => (RuleAction::Next, None),
        Some("Record") => (RuleAction::Record, None),
        Some("Continue") => (RuleAction::Continue, None),
        Some("Continue.Record") => (RuleAction::ContinueRecord, None),
        Some("Error") => (RuleAction::Error, None),
        Some(other) => match other.split_once(' ') {
            Some(("Record", state)) => (RuleAction::Record, Some(state.trim().to_owned())),
            Some(("Next", state)) => (RuleAction::Next, Some(state.trim().to_owned())),
            _ => (RuleAction::Next, Some(other.to_owned())),
        },
    };

    Ok(Rule {
        regex,
        action,
        next_state,
    })
}

/// Compile and run a template in one step.
pub fn parse(template_source: &str, raw: &str) -> Result<Vec<Map<String, Value>>, ParserError> {
    Template::compile(template_source)?.parse(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOW_VERSION_TEMPLATE: &str = "\
Value VERSION (\\S+)
Value HOSTNAME (\\S+)
Value UPTIME (.+)
Value CONFIG_REGISTER (\\S+)

Start
  ^.*Software \\(.*\\), Version ${VERSION},
  ^\\s*${HOSTNAME} uptime is ${UPTIME}
  ^Configuration register is ${CONFIG_REGISTER} -> Record
";

    const SHOW_VERSION_OUTPUT: &str = "\
Cisco IOS Software, C2900 Software (C2900-UNIVERSALK9-M), Version 15.2(4)M6a, RELEASE SOFTWARE (fc1)
rtr1 uptime is 2 weeks, 3 days, 4 hours
Configuration register is 0x2102
";

    #[test]
    fn extracts_fields_into_a_record() {
        let records = parse(SHOW_VERSION_TEMPLATE, SHOW_VERSION_OUTPUT).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["VERSION"], "15.2(4)M6a");
        assert_eq!(records[0]["HOSTNAME"], "rtr1");
        assert_eq!(records[0]["UPTIME"], "2 weeks, 3 days, 4 hours");
        assert_eq!(records[0]["CONFIG_REGISTER"], "0x2102");
    }

    #[test]
    fn emits_one_record_per_matching_row() {
        let template = "\
Value INTF (\\S+)
Value STATUS (up|down)

Start
  ^${INTF}\\s+${STATUS}\\s*$ -> Record
";
        let output = "Gi0/0  up\nGi0/1  down\nsome noise\nGi0/2  up\n";
        let records = parse(template, output).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0]["INTF"], "Gi0/0");
        assert_eq!(records[1]["STATUS"], "down");
        assert_eq!(records[2]["INTF"], "Gi0/2");
    }

    #[test]
    fn filldown_values_persist_and_lists_accumulate() {
        let template = "\
Value Filldown CHASSIS (\\S+)
Value List MEMBER (\\S+)
Value PORT (\\S+)

Start
  ^Chassis ${CHASSIS}
  ^member ${MEMBER} -> Continue
  ^member \\S+ port ${PORT} -> Record
";
        let output = "\
Chassis alpha
member one port p1
member two port p2
";
        let records = parse(template, output).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["CHASSIS"], "alpha");
        assert_eq!(records[0]["MEMBER"], serde_json::json!(["one"]));
        assert_eq!(records[0]["PORT"], "p1");
        // Filldown carries CHASSIS into the second record.
        assert_eq!(records[1]["CHASSIS"], "alpha");
        assert_eq!(records[1]["MEMBER"], serde_json::json!(["two"]));
    }

    #[test]
    fn required_values_gate_the_record() {
        let template = "\
Value Required INTF (\\S+)
Value DESCR (.+)

Start
  ^Description: ${DESCR} -> Record
  ^interface ${INTF}
";
        // A Description with no preceding interface never records.
        let records = parse(template, "Description: uplink\n").unwrap();
        assert!(records.is_empty());

        let records = parse(template, "interface Gi0/0\nDescription: uplink\n").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["INTF"], "Gi0/0");
    }

    #[test]
    fn implicit_record_at_end_of_input() {
        let template = "\
Value HOSTNAME (\\S+)

Start
  ^hostname ${HOSTNAME}
";
        let records = parse(template, "hostname rtr1\n").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["HOSTNAME"], "rtr1");
    }

    #[test]
    fn missing_start_state_is_a_template_error() {
        let result = Template::compile("Value X (\\S+)\n\nNotStart\n  ^x ${X}\n");
        assert!(matches!(result, Err(ParserError::Template(_))));
    }

    #[test]
    fn error_action_fails_the_parse() {
        let template = "\
Value X (\\S+)

Start
  ^ok ${X} -> Record
  ^%.* -> Error
";
        assert!(parse(template, "ok fine\n").is_ok());
        assert!(matches!(
            parse(template, "% Invalid input\n"),
            Err(ParserError::Parse(_))
        ));
    }
}
