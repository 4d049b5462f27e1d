//! Parameter ports and the configuration surface.
//!
//! A [`ConfigFile`] annotation attaches an XML configuration document
//! to a subtree. Parameter ports carry a [`ParameterInfo`] annotation
//! naming an optional config entry (absolute `/...` or relative to the
//! nearest [`ConfigNode`]), an optional command-line option and an
//! optional default literal. Load order per parameter: command line,
//! then config entry, then default; the first non-empty source wins.
//! A literal that fails to parse logs a warning and leaves the
//! previous value in place.

use std::sync::Arc;

use ahash::AHashMap;
use axon_core::{Annotation, DuplicateAnnotation};
use parking_lot::RwLock;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::element::Element;
use crate::error::ConfigError;
use crate::port::Port;

/// XML configuration document attached to a framework-element
/// subtree. Entries are slash-separated paths of nested element names.
#[derive(Debug, Default)]
pub struct ConfigFile {
    entries: RwLock<AHashMap<String, String>>,
}

impl Annotation for ConfigFile {}

impl ConfigFile {
    pub fn parse(xml: &str) -> Result<ConfigFile, ConfigError> {
        let mut reader = Reader::from_str(xml);
        let mut entries = AHashMap::new();
        let mut path: Vec<String> = Vec::new();
        let mut saw_root = false;

        loop {
            match reader.read_event()? {
                Event::Start(start) => {
                    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                    if saw_root {
                        path.push(name);
                    } else {
                        saw_root = true;
                    }
                }
                Event::End(_) => {
                    path.pop();
                }
                Event::Text(text) => {
                    let value = text
                        .unescape()
                        .map_err(quick_xml::Error::from)?
                        .trim()
                        .to_string();
                    if !value.is_empty() && !path.is_empty() {
                        entries.insert(format!("/{}", path.join("/")), value);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(ConfigFile {
            entries: RwLock::new(entries),
        })
    }

    pub fn from_file(path: &std::path::Path) -> Result<ConfigFile, ConfigError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn has_entry(&self, path: &str) -> bool {
        self.entries.read().contains_key(path)
    }

    pub fn entry(&self, path: &str) -> Option<String> {
        self.entries.read().get(path).cloned()
    }

    /// Update an entry at runtime (admin surface).
    pub fn set_entry(&self, path: &str, value: &str) {
        self.entries
            .write()
            .insert(path.to_string(), value.to_string());
    }

    pub fn remove_entry(&self, path: &str) {
        self.entries.write().remove(path);
    }

    /// The config file responsible for `element`: the nearest one on
    /// the path to the root, including `element` itself.
    pub fn find(element: &Arc<Element>) -> Option<Arc<ConfigFile>> {
        let mut cur = Some(element.clone());
        while let Some(el) = cur {
            if let Some(cf) = el.get_annotation::<ConfigFile>() {
                return Some(cf);
            }
            cur = el.parent();
        }
        None
    }
}

/// Prefix for relative config entries of a subtree.
#[derive(Debug)]
pub struct ConfigNode {
    pub prefix: String,
}

impl Annotation for ConfigNode {}

/// Resolve a (possibly relative) config entry for an element by
/// walking [`ConfigNode`] prefixes towards the root.
pub fn full_config_entry(element: &Arc<Element>, entry: &str) -> String {
    if entry.starts_with('/') {
        return entry.to_string();
    }
    let mut segments: Vec<String> = vec![entry.trim_matches('/').to_string()];
    let mut cur = Some(element.clone());
    while let Some(el) = cur {
        if let Some(node) = el.get_annotation::<ConfigNode>() {
            let absolute = node.prefix.starts_with('/');
            let trimmed = node.prefix.trim_matches('/');
            if !trimmed.is_empty() {
                segments.push(trimmed.to_string());
            }
            if absolute {
                break;
            }
        }
        cur = el.parent();
    }
    segments.reverse();
    format!("/{}", segments.join("/"))
}

/// Annotation describing where a parameter port loads its value from.
#[derive(Debug, Default)]
pub struct ParameterInfo {
    pub config_entry: Option<String>,
    pub command_line_option: Option<String>,
    pub default_literal: Option<String>,
}

impl Annotation for ParameterInfo {}

impl ParameterInfo {
    pub fn attach(port: &Port, info: ParameterInfo) -> Result<(), DuplicateAnnotation> {
        port.element().add_annotation(Arc::new(info))
    }

    /// Load the parameter value: command line, then config entry,
    /// then default. The first source that parses wins.
    pub fn load_value(&self, port: &Port) {
        if let Some(key) = &self.command_line_option {
            if let Some(runtime) = port.element().runtime() {
                if let Some(arg) = runtime.command_line_arg(key) {
                    if !arg.is_empty() && apply_literal(port, &arg, "command line") {
                        return;
                    }
                }
            }
        }

        if let Some(entry) = &self.config_entry {
            if let Some(config) = ConfigFile::find(port.element()) {
                let full = full_config_entry(port.element(), entry);
                if let Some(literal) = config.entry(&full) {
                    if apply_literal(port, &literal, "config entry") {
                        return;
                    }
                }
            }
        }

        if let Some(literal) = &self.default_literal {
            apply_literal(port, literal, "default");
        }
    }
}

fn apply_literal(port: &Port, literal: &str, origin: &str) -> bool {
    let Some(mut owned) = port.get_unused() else {
        log::warn!(
            "parameter '{}': no buffer available to load {} value",
            port.element().qualified_name(),
            origin
        );
        return false;
    };
    if let Err(e) = owned.value_mut().parse_assign(literal) {
        log::warn!(
            "parameter '{}': {} value rejected: {}",
            port.element().qualified_name(),
            origin,
            e
        );
        return false;
    }
    port.publish(owned);
    true
}

/// Called during element init: apply parameter values once the
/// element is visible.
pub(crate) fn load_on_init(element: &Arc<Element>) {
    if let Some(info) = element.get_annotation::<ParameterInfo>() {
        if let Some(port) = Port::from_element(element) {
            info.load_value(&port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{ElementFlags, ElementKind};
    use crate::port::{DataPort, PortCreationInfo};
    use crate::runtime::Runtime;
    use axon_core::TypeRegistry;

    fn int_param(rt: &Arc<Runtime>, parent: &Arc<Element>, name: &str) -> DataPort<i64> {
        let ty = TypeRegistry::global().register_value::<i64>("Int64", true);
        DataPort::new(PortCreationInfo::new(rt, parent, name, ty)).unwrap()
    }

    #[test]
    fn config_documents_flatten_to_paths() {
        let cf = ConfigFile::parse(
            "<config>\n  <x><k>8</k><deep><v>1.5</v></deep></x>\n</config>",
        )
        .unwrap();
        assert_eq!(cf.entry("/x/k").as_deref(), Some("8"));
        assert_eq!(cf.entry("/x/deep/v").as_deref(), Some("1.5"));
        assert!(!cf.has_entry("/x"));
    }

    #[test]
    fn load_precedence_command_line_config_default() {
        let rt = Runtime::new();
        let module = Element::new(
            &rt,
            rt.root(),
            "module",
            ElementFlags::empty(),
            ElementKind::Plain,
        )
        .unwrap();
        module
            .add_annotation(Arc::new(
                ConfigFile::parse("<config><x><k>8</k></x></config>").unwrap(),
            ))
            .unwrap();

        let param = int_param(&rt, &module, "k");
        ParameterInfo::attach(
            param.port(),
            ParameterInfo {
                config_entry: Some("/x/k".into()),
                command_line_option: Some("k".into()),
                default_literal: Some("7".into()),
            },
        )
        .unwrap();

        rt.set_command_line_arg("k", "9");
        module.init().unwrap();
        assert_eq!(param.get(), 9);

        let info = param.port().element().get_annotation::<ParameterInfo>().unwrap();

        rt.remove_command_line_arg("k");
        info.load_value(param.port());
        assert_eq!(param.get(), 8);

        ConfigFile::find(param.port().element())
            .unwrap()
            .remove_entry("/x/k");
        info.load_value(param.port());
        assert_eq!(param.get(), 7);
    }

    #[test]
    fn config_nodes_prefix_relative_entries() {
        let rt = Runtime::new();
        let module = Element::new(
            &rt,
            rt.root(),
            "module",
            ElementFlags::empty(),
            ElementKind::Plain,
        )
        .unwrap();
        module
            .add_annotation(Arc::new(ConfigNode {
                prefix: "/robot/arm".into(),
            }))
            .unwrap();
        let param = int_param(&rt, &module, "speed");

        assert_eq!(
            full_config_entry(param.port().element(), "speed"),
            "/robot/arm/speed"
        );
        assert_eq!(full_config_entry(param.port().element(), "/abs"), "/abs");
    }

    #[test]
    fn unparseable_literal_keeps_the_previous_value() {
        let rt = Runtime::new();
        let module = Element::new(
            &rt,
            rt.root(),
            "module",
            ElementFlags::empty(),
            ElementKind::Plain,
        )
        .unwrap();
        let param = int_param(&rt, &module, "k");
        ParameterInfo::attach(
            param.port(),
            ParameterInfo {
                default_literal: Some("11".into()),
                ..Default::default()
            },
        )
        .unwrap();
        module.init().unwrap();
        assert_eq!(param.get(), 11);

        rt.set_command_line_arg("k", "not-a-number");
        let info = ParameterInfo {
            command_line_option: Some("k".into()),
            default_literal: None,
            config_entry: None,
        };
        info.load_value(param.port());
        assert_eq!(param.get(), 11);
    }
}
