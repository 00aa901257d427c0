//! Parser dispatch: template resolution (explicit > inline > custom index >
//! builtin index) and execution on one of the two engines. Templates are
//! read from disk on every parse call so operators can drop new ones in
//! without a restart.

pub mod index;
pub mod textfsm;
pub mod ttp;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use index::IndexEntry;

const BUILTIN_INDEX: &str = include_str!("../../builtin/index.csv");

/// Builtin template library. Only the row-oriented engine ships one; the
/// hierarchical engine has no bundled templates.
const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    (
        "cisco_ios_show_version.textfsm",
        include_str!("../../builtin/cisco_ios_show_version.textfsm"),
    ),
    (
        "cisco_ios_show_ip_interface_brief.textfsm",
        include_str!("../../builtin/cisco_ios_show_ip_interface_brief.textfsm"),
    ),
    (
        "arista_eos_show_version.textfsm",
        include_str!("../../builtin/arista_eos_show_version.textfsm"),
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Textfsm,
    Ttp,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Textfsm => "textfsm",
            Engine::Ttp => "ttp",
        }
    }
}

impl FromStr for Engine {
    type Err = ParserError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "textfsm" => Ok(Engine::Textfsm),
            "ttp" => Ok(Engine::Ttp),
            other => Err(ParserError::UnknownEngine(other.to_owned())),
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemplateSource {
    Explicit,
    Inline,
    Custom,
    Builtin,
}

#[derive(Error, Debug)]
pub enum ParserError {
    #[error("no template found for {0}")]
    TemplateNotFound(String),
    #[error("unknown parser engine {0}")]
    UnknownEngine(String),
    #[error("template error: {0}")]
    Template(String),
    #[error("parse failed: {0}")]
    Parse(String),
    #[error("template read failed: {0}")]
    Io(String),
}

/// A template ready to run: its text plus where it came from.
#[derive(Debug, Clone)]
pub struct ResolvedTemplate {
    pub name: Option<String>,
    pub source: TemplateSource,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct TemplateListing {
    pub name: String,
    pub source: TemplateSource,
}

/// Result of one parse call, rendered to clients as
/// `{parsed, raw?, _metadata: {template_source, template_name}}`.
#[derive(Debug)]
pub struct ParseOutcome {
    pub parsed: Value,
    pub raw: Option<String>,
    pub template_source: TemplateSource,
    pub template_name: Option<String>,
}

impl ParseOutcome {
    pub fn envelope(&self) -> Value {
        let mut body = json!({
            "parsed": self.parsed,
            "_metadata": {
                "template_source": self.template_source,
                "template_name": self.template_name,
            },
        });
        if let Some(raw) = &self.raw {
            body["raw"] = Value::String(raw.clone());
        }
        body
    }
}

fn builtin_index() -> &'static [IndexEntry] {
    static INDEX: OnceLock<Vec<IndexEntry>> = OnceLock::new();
    INDEX.get_or_init(|| index::parse_index(BUILTIN_INDEX).expect("builtin index is well-formed"))
}

fn builtin_template(name: &str) -> Option<&'static str> {
    BUILTIN_TEMPLATES
        .iter()
        .find(|(template_name, _)| *template_name == name)
        .map(|(_, text)| *text)
}

pub struct ParserDispatch {
    custom_dir: PathBuf,
}

impl ParserDispatch {
    pub fn new(custom_dir: impl Into<PathBuf>) -> Self {
        Self {
            custom_dir: custom_dir.into(),
        }
    }

    fn engine_dir(&self, engine: Engine) -> PathBuf {
        self.custom_dir.join(engine.as_str())
    }

    fn read_custom(&self, engine: Engine, name: &str) -> Option<String> {
        let path = self.engine_dir(engine).join(name);
        read_template_file(&path).ok()
    }

    fn custom_index(&self, engine: Engine) -> Result<Vec<IndexEntry>, ParserError> {
        let path = self.engine_dir(engine).join("index.csv");
        match read_template_file(&path) {
            Ok(text) => index::parse_index(&text),
            Err(_) => Ok(Vec::new()),
        }
    }

    /// Resolve a template by the precedence contract:
    /// explicit filename > inline text > custom index > builtin index.
    /// Index selection matches `(hostname, platform, command)`; a missing
    /// hostname leaves the index's Hostname column unconstrained.
    pub fn resolve(
        &self,
        engine: Engine,
        explicit: Option<&str>,
        inline: Option<&str>,
        hostname: Option<&str>,
        platform: Option<&str>,
        command: Option<&str>,
    ) -> Result<ResolvedTemplate, ParserError> {
        if let Some(name) = explicit {
            // A custom file shadows a bundled one only on explicit requests.
            if let Some(text) = self.read_custom(engine, name) {
                return Ok(ResolvedTemplate {
                    name: Some(name.to_owned()),
                    source: TemplateSource::Explicit,
                    text,
                });
            }
            if engine == Engine::Textfsm {
                if let Some(text) = builtin_template(name) {
                    return Ok(ResolvedTemplate {
                        name: Some(name.to_owned()),
                        source: TemplateSource::Explicit,
                        text: text.to_owned(),
                    });
                }
            }
            return Err(ParserError::TemplateNotFound(name.to_owned()));
        }

        if let Some(text) = inline {
            if engine != Engine::Ttp {
                return Err(ParserError::Template(
                    "inline templates are only supported by the ttp engine".to_owned(),
                ));
            }
            return Ok(ResolvedTemplate {
                name: None,
                source: TemplateSource::Inline,
                text: text.to_owned(),
            });
        }

        let (Some(platform), Some(command)) = (platform, command) else {
            return Err(ParserError::TemplateNotFound(
                "no template given and no platform/command to select one".to_owned(),
            ));
        };

        let custom_entries = self.custom_index(engine)?;
        if let Some(entry) = index::find(&custom_entries, hostname, platform, command)? {
            let text = self.read_custom(engine, &entry.template).ok_or_else(|| {
                ParserError::Io(format!(
                    "index names {} but the file is unreadable",
                    entry.template
                ))
            })?;
            return Ok(ResolvedTemplate {
                name: Some(entry.template.clone()),
                source: TemplateSource::Custom,
                text,
            });
        }

        if engine == Engine::Textfsm {
            if let Some(entry) = index::find(builtin_index(), hostname, platform, command)? {
                let text = builtin_template(&entry.template)
                    .expect("builtin index only names bundled templates");
                return Ok(ResolvedTemplate {
                    name: Some(entry.template.clone()),
                    source: TemplateSource::Builtin,
                    text: text.to_owned(),
                });
            }
        }

        Err(ParserError::TemplateNotFound(format!(
            "({}, {})",
            platform, command
        )))
    }

    /// Which template auto-selection would choose for a device and command.
    pub fn find_template(
        &self,
        engine: Engine,
        hostname: Option<&str>,
        platform: &str,
        command: &str,
    ) -> Result<(String, TemplateSource), ParserError> {
        let resolved = self.resolve(engine, None, None, hostname, Some(platform), Some(command))?;
        Ok((
            resolved.name.unwrap_or_default(),
            resolved.source,
        ))
    }

    /// Run a resolved template over raw output.
    pub fn run(
        &self,
        engine: Engine,
        resolved: &ResolvedTemplate,
        raw: &str,
        include_raw: bool,
    ) -> Result<ParseOutcome, ParserError> {
        let parsed = match engine {
            Engine::Textfsm => {
                let records = textfsm::parse(&resolved.text, raw)?;
                Value::Array(records.into_iter().map(Value::Object).collect())
            }
            Engine::Ttp => ttp::parse(&resolved.text, raw)?,
        };
        Ok(ParseOutcome {
            parsed,
            raw: include_raw.then(|| raw.to_owned()),
            template_source: resolved.source,
            template_name: resolved.name.clone(),
        })
    }

    /// Everything selectable for an engine: custom directory files plus the
    /// bundled library.
    pub fn list(&self, engine: Engine) -> Vec<TemplateListing> {
        let mut listings = Vec::new();
        if let Ok(entries) = std::fs::read_dir(self.engine_dir(engine)) {
            let mut names: Vec<String> = entries
                .flatten()
                .filter(|e| e.path().is_file())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name != "index.csv")
                .collect();
            names.sort();
            listings.extend(names.into_iter().map(|name| TemplateListing {
                name,
                source: TemplateSource::Custom,
            }));
        }
        if engine == Engine::Textfsm {
            listings.extend(BUILTIN_TEMPLATES.iter().map(|(name, _)| TemplateListing {
                name: (*name).to_owned(),
                source: TemplateSource::Builtin,
            }));
        }
        listings
    }
}

fn read_template_file(path: &Path) -> Result<String, ParserError> {
    std::fs::read_to_string(path).map_err(|e| ParserError::Io(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOW_VERSION_OUTPUT: &str = "\
Cisco IOS Software, C2900 Software (C2900-UNIVERSALK9-M), Version 15.2(4)M6a, RELEASE SOFTWARE (fc1)
ROM: System Bootstrap, Version 15.0(1r)M15, RELEASE SOFTWARE (fc1)
rtr1 uptime is 2 weeks, 3 days
Configuration register is 0x2102
";

    fn dispatch_with_custom_dir() -> (std::path::PathBuf, ParserDispatch) {
        let dir = std::env::temp_dir().join(format!(
            "sb-templates-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(dir.join("textfsm")).unwrap();
        (dir.clone(), ParserDispatch::new(dir))
    }

    #[test]
    fn builtin_index_selects_by_platform_and_command() {
        let (dir, dispatch) = dispatch_with_custom_dir();

        let (name, source) = dispatch
            .find_template(Engine::Textfsm, None, "cisco_ios", "show version")
            .unwrap();
        assert_eq!(name, "cisco_ios_show_version.textfsm");
        assert_eq!(source, TemplateSource::Builtin);

        // Abbreviated commands resolve through the index regexes.
        let (name, _) = dispatch
            .find_template(Engine::Textfsm, None, "cisco_ios", "sh ver")
            .unwrap();
        assert_eq!(name, "cisco_ios_show_version.textfsm");

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn custom_index_beats_builtin() {
        let (dir, dispatch) = dispatch_with_custom_dir();
        std::fs::write(
            dir.join("textfsm/index.csv"),
            "Template, Hostname, Platform, Command\nlocal_show_version.textfsm, .*, cisco_ios, sh(ow)? ver(sion)?\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("textfsm/local_show_version.textfsm"),
            "Value VERSION (\\S+)\n\nStart\n  ^.*Version ${VERSION}, -> Record\n",
        )
        .unwrap();

        let (name, source) = dispatch
            .find_template(Engine::Textfsm, None, "cisco_ios", "show version")
            .unwrap();
        assert_eq!(name, "local_show_version.textfsm");
        assert_eq!(source, TemplateSource::Custom);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn hostname_rows_gate_custom_entries() {
        let (dir, dispatch) = dispatch_with_custom_dir();
        std::fs::write(
            dir.join("textfsm/index.csv"),
            "Template, Hostname, Platform, Command\nedge_show_version.textfsm, rtr-edge.*, cisco_ios, sh(ow)? ver(sion)?\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("textfsm/edge_show_version.textfsm"),
            "Value VERSION (\\S+)\n\nStart\n  ^.*Version ${VERSION}, -> Record\n",
        )
        .unwrap();

        // An edge hostname picks the restricted custom row.
        let (name, source) = dispatch
            .find_template(Engine::Textfsm, Some("rtr-edge-1"), "cisco_ios", "show version")
            .unwrap();
        assert_eq!(name, "edge_show_version.textfsm");
        assert_eq!(source, TemplateSource::Custom);

        // Any other hostname falls past it to the bundled library.
        let (name, source) = dispatch
            .find_template(Engine::Textfsm, Some("rtr-core-1"), "cisco_ios", "show version")
            .unwrap();
        assert_eq!(name, "cisco_ios_show_version.textfsm");
        assert_eq!(source, TemplateSource::Builtin);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn explicit_template_names_resolve_to_bundled_files() {
        let (dir, dispatch) = dispatch_with_custom_dir();

        let resolved = dispatch
            .resolve(
                Engine::Textfsm,
                Some("cisco_ios_show_version.textfsm"),
                None,
                None,
                None,
                None,
            )
            .unwrap();
        assert_eq!(resolved.source, TemplateSource::Explicit);

        let outcome = dispatch
            .run(Engine::Textfsm, &resolved, SHOW_VERSION_OUTPUT, false)
            .unwrap();
        assert_eq!(outcome.parsed[0]["VERSION"], "15.2(4)M6a");
        assert_eq!(outcome.parsed[0]["HOSTNAME"], "rtr1");

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn explicit_custom_file_shadows_the_bundled_one() {
        let (dir, dispatch) = dispatch_with_custom_dir();
        std::fs::write(
            dir.join("textfsm/cisco_ios_show_version.textfsm"),
            "Value ONLY_HOSTNAME (\\S+)\n\nStart\n  ^\\s*${ONLY_HOSTNAME} uptime is -> Record\n",
        )
        .unwrap();

        let resolved = dispatch
            .resolve(
                Engine::Textfsm,
                Some("cisco_ios_show_version.textfsm"),
                None,
                None,
                None,
                None,
            )
            .unwrap();
        let outcome = dispatch
            .run(Engine::Textfsm, &resolved, SHOW_VERSION_OUTPUT, false)
            .unwrap();
        // The shadowing template only extracts the hostname.
        assert_eq!(outcome.parsed[0]["ONLY_HOSTNAME"], "rtr1");
        assert!(outcome.parsed[0].get("VERSION").is_none());

        // Auto-selection still uses the bundled index, not the custom file.
        let (_, source) = dispatch
            .find_template(Engine::Textfsm, None, "cisco_ios", "show version")
            .unwrap();
        assert_eq!(source, TemplateSource::Builtin);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn inline_templates_are_ttp_only() {
        let (dir, dispatch) = dispatch_with_custom_dir();

        let resolved = dispatch
            .resolve(
                Engine::Ttp,
                None,
                Some("hostname {{ hostname }}"),
                None,
                None,
                None,
            )
            .unwrap();
        assert_eq!(resolved.source, TemplateSource::Inline);
        let outcome = dispatch
            .run(Engine::Ttp, &resolved, "hostname rtr1\n", true)
            .unwrap();
        assert_eq!(outcome.parsed["hostname"], "rtr1");
        assert!(outcome.raw.is_some());

        assert!(matches!(
            dispatch.resolve(Engine::Textfsm, None, Some("x {{ y }}"), None, None, None),
            Err(ParserError::Template(_))
        ));

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn unresolvable_templates_fail_with_template_not_found() {
        let (dir, dispatch) = dispatch_with_custom_dir();

        assert!(matches!(
            dispatch.find_template(Engine::Textfsm, None, "vyos", "show interfaces"),
            Err(ParserError::TemplateNotFound(_))
        ));
        // The ttp engine ships no builtin library at all.
        assert!(matches!(
            dispatch.find_template(Engine::Ttp, None, "cisco_ios", "show version"),
            Err(ParserError::TemplateNotFound(_))
        ));

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn envelope_reports_source_and_name() {
        let (dir, dispatch) = dispatch_with_custom_dir();

        let resolved = dispatch
            .resolve(
                Engine::Textfsm,
                None,
                None,
                None,
                Some("cisco_ios"),
                Some("show version"),
            )
            .unwrap();
        let outcome = dispatch
            .run(Engine::Textfsm, &resolved, SHOW_VERSION_OUTPUT, false)
            .unwrap();
        let envelope = outcome.envelope();
        assert_eq!(envelope["_metadata"]["template_source"], "BUILTIN");
        assert_eq!(
            envelope["_metadata"]["template_name"],
            "cisco_ios_show_version.textfsm"
        );
        assert!(envelope.get("raw").is_none());

        std::fs::remove_dir_all(dir).unwrap();
    }
}
