// SPDX-License-Identifier: AGPL-3.0-or-later
//! Splunk `.conf` settings
//!
//! Settings arrive grouped by file and stanza and are flattened into one
//! record per option. Files are edited in place: comments, ordering and
//! options nobody asked about are kept.

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, instrument};

use super::api::Presence;
use crate::config::SplunkConfig;
use crate::error::Result;
use crate::host::HostSystem;

/// Settings for one `.conf` file, as written by operators
#[derive(Debug, Clone, Deserialize)]
pub struct ConfGroup {
    pub filepath: String,
    pub filename: String,
    #[serde(default)]
    pub sections: Vec<ConfSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfSection {
    #[serde(default)]
    pub section: String,
    #[serde(default)]
    pub options: Vec<ConfOption>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfOption {
    pub option: String,
    #[serde(default, deserialize_with = "scalar")]
    pub value: String,
    #[serde(default)]
    pub state: Presence,
    #[serde(default)]
    pub comment: String,
}

/// One option in one stanza of one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfSetting {
    pub path: String,
    pub section: String,
    pub option: String,
    pub value: String,
    pub state: Presence,
    pub comment: String,
}

/// Whether applying settings changed a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfChange {
    pub path: String,
    pub changed: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

fn scalar<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::Text(s) => s,
        Scalar::Integer(i) => i.to_string(),
        Scalar::Float(f) => f.to_string(),
        Scalar::Bool(b) => b.to_string(),
    })
}

/// Turn grouped settings into one record per option
///
/// Sections with an empty name are skipped.
pub fn flatten(groups: &[ConfGroup]) -> Vec<ConfSetting> {
    groups
        .iter()
        .flat_map(|group| {
            let path = format!("{}/{}", group.filepath, group.filename);
            group
                .sections
                .iter()
                .filter(|section| !section.section.is_empty())
                .flat_map(move |section| {
                    let path = path.clone();
                    section.options.iter().map(move |option| ConfSetting {
                        path: path.clone(),
                        section: section.section.clone(),
                        option: option.option.clone(),
                        value: option.value.clone(),
                        state: option.state,
                        comment: option.comment.clone(),
                    })
                })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
enum Line {
    /// `raw` keeps the original text until the value is changed
    Setting {
        key: String,
        value: String,
        raw: Option<String>,
    },
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Stanza {
    name: Option<String>,
    lines: Vec<Line>,
}

/// A parsed `.conf` file
#[derive(Debug, Clone, PartialEq)]
pub struct ConfDocument {
    stanzas: Vec<Stanza>,
}

impl ConfDocument {
    pub fn parse(contents: &str) -> Self {
        let mut stanzas = vec![Stanza {
            name: None,
            lines: Vec::new(),
        }];

        for raw in contents.lines() {
            let trimmed = raw.trim();
            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                stanzas.push(Stanza {
                    name: Some(trimmed[1..trimmed.len() - 1].trim().to_string()),
                    lines: Vec::new(),
                });
                continue;
            }

            let line = match trimmed.split_once('=') {
                Some((key, value)) if !trimmed.starts_with('#') && !key.trim().is_empty() => {
                    Line::Setting {
                        key: key.trim().to_string(),
                        value: value.trim().to_string(),
                        raw: Some(raw.to_string()),
                    }
                }
                _ => Line::Other(raw.to_string()),
            };
            if let Some(stanza) = stanzas.last_mut() {
                stanza.lines.push(line);
            }
        }

        Self { stanzas }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for stanza in &self.stanzas {
            if let Some(name) = &stanza.name {
                out.push_str(&format!("[{}]\n", name));
            }
            for line in &stanza.lines {
                match line {
                    Line::Setting {
                        raw: Some(text), ..
                    } => {
                        out.push_str(text);
                        out.push('\n');
                    }
                    Line::Setting { key, value, .. } => {
                        out.push_str(&format!("{} = {}\n", key, value));
                    }
                    Line::Other(text) => {
                        out.push_str(text);
                        out.push('\n');
                    }
                }
            }
        }
        out
    }

    pub fn get(&self, section: &str, option: &str) -> Option<&str> {
        self.stanzas
            .iter()
            .filter(|s| s.name.as_deref() == Some(section))
            .flat_map(|s| s.lines.iter())
            .find_map(|line| match line {
                Line::Setting { key, value, .. } if key == option => Some(value.as_str()),
                _ => None,
            })
    }

    /// Set an option, creating the stanza if needed; returns whether anything changed
    pub fn set(&mut self, section: &str, option: &str, value: &str, comment: &str) -> bool {
        let index = match self
            .stanzas
            .iter()
            .position(|s| s.name.as_deref() == Some(section))
        {
            Some(index) => index,
            None => {
                if let Some(last) = self.stanzas.last_mut() {
                    let blank_needed = last
                        .lines
                        .last()
                        .is_some_and(|l| !matches!(l, Line::Other(t) if t.trim().is_empty()));
                    if blank_needed || (last.name.is_some() && last.lines.is_empty()) {
                        last.lines.push(Line::Other(String::new()));
                    }
                }
                self.stanzas.push(Stanza {
                    name: Some(section.to_string()),
                    lines: Vec::new(),
                });
                self.stanzas.len() - 1
            }
        };

        let stanza = &mut self.stanzas[index];
        for line in stanza.lines.iter_mut() {
            if let Line::Setting {
                key,
                value: current,
                raw,
            } = line
            {
                if key == option {
                    if current == value {
                        return false;
                    }
                    *current = value.to_string();
                    *raw = None;
                    return true;
                }
            }
        }

        // Insert before trailing blank lines so stanzas stay separated
        let mut at = stanza.lines.len();
        while at > 0 && matches!(&stanza.lines[at - 1], Line::Other(t) if t.trim().is_empty()) {
            at -= 1;
        }
        let mut new_lines = Vec::new();
        if !comment.is_empty() {
            new_lines.push(Line::Other(format!("# {}", comment)));
        }
        new_lines.push(Line::Setting {
            key: option.to_string(),
            value: value.to_string(),
            raw: None,
        });
        stanza.lines.splice(at..at, new_lines);
        true
    }

    /// Remove an option; returns whether it was present
    pub fn remove(&mut self, section: &str, option: &str) -> bool {
        let mut removed = false;
        for stanza in self
            .stanzas
            .iter_mut()
            .filter(|s| s.name.as_deref() == Some(section))
        {
            let before = stanza.lines.len();
            stanza
                .lines
                .retain(|line| !matches!(line, Line::Setting { key, .. } if key == option));
            removed |= stanza.lines.len() != before;
        }
        removed
    }
}

/// Apply flattened settings to their files on `host`
///
/// Files are read once, edited in memory and only written when their
/// rendered contents differ. Results are in first-mention order of the paths.
#[instrument(skip_all, fields(host = %host.name(), settings = settings.len()))]
pub async fn apply_settings(
    host: &dyn HostSystem,
    settings: &[ConfSetting],
    owner: &SplunkConfig,
) -> Result<Vec<ConfChange>> {
    let mut paths: Vec<&str> = Vec::new();
    for setting in settings {
        if !paths.contains(&setting.path.as_str()) {
            paths.push(&setting.path);
        }
    }

    let mut changes = Vec::with_capacity(paths.len());
    for path in paths {
        let original = host.read_file(path).await?;
        let mut document = ConfDocument::parse(original.as_deref().unwrap_or_default());

        for setting in settings.iter().filter(|s| s.path == path) {
            match setting.state {
                Presence::Present => {
                    document.set(
                        &setting.section,
                        &setting.option,
                        &setting.value,
                        &setting.comment,
                    );
                }
                Presence::Absent => {
                    document.remove(&setting.section, &setting.option);
                }
            }
        }

        let rendered = document.render();
        let changed = original.as_deref() != Some(rendered.as_str())
            && !(original.is_none() && rendered.trim().is_empty());
        if changed {
            host.write_file(path, &rendered, 0o644).await?;
            host.chown(path, &owner.user, &owner.group, false).await?;
            info!(path = %path, "Configuration file updated");
        } else {
            debug!(path = %path, "Configuration file unchanged");
        }
        changes.push(ConfChange {
            path: path.to_string(),
            changed,
        });
    }
    Ok(changes)
}
