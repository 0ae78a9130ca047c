//! Field Mapper
//!
//! Rewrites an event into the configured output shape. The template tree is
//! compiled once; every string leaf is rendered against the event while key
//! order and sequence order are kept as configured.

use hc_common::{Event, MappingTemplate};
use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::template::Template;

#[derive(Debug, Clone)]
enum Node {
    Text(Template),
    List(Vec<Node>),
    Map(Vec<(String, Node)>),
    Literal(Value),
}

impl Node {
    fn compile(template: &MappingTemplate) -> Self {
        match template {
            MappingTemplate::Text(text) => Node::Text(Template::parse(text)),
            MappingTemplate::List(items) => Node::List(items.iter().map(Node::compile).collect()),
            MappingTemplate::Map(entries) => Node::Map(compile_entries(entries)),
            MappingTemplate::Literal(value) => Node::Literal(value.clone()),
        }
    }

    fn render(&self, event: &Event) -> Value {
        match self {
            Node::Text(template) => Value::String(template.render(event)),
            Node::List(items) => Value::Array(items.iter().map(|n| n.render(event)).collect()),
            Node::Map(entries) => Value::Object(render_entries(entries, event)),
            Node::Literal(value) => value.clone(),
        }
    }
}

fn compile_entries(entries: &IndexMap<String, MappingTemplate>) -> Vec<(String, Node)> {
    entries
        .iter()
        .map(|(key, template)| (key.clone(), Node::compile(template)))
        .collect()
}

fn render_entries(entries: &[(String, Node)], event: &Event) -> Map<String, Value> {
    entries
        .iter()
        .map(|(key, node)| (key.clone(), node.render(event)))
        .collect()
}

/// Compiled mapping; `None` mapping means the event passes through unchanged
#[derive(Debug, Clone, Default)]
pub struct FieldMapper {
    entries: Option<Vec<(String, Node)>>,
}

impl FieldMapper {
    pub fn new(mapping: Option<&IndexMap<String, MappingTemplate>>) -> Self {
        Self { entries: mapping.map(compile_entries) }
    }

    /// Identity mapper
    pub fn passthrough() -> Self {
        Self::default()
    }

    pub fn is_passthrough(&self) -> bool {
        self.entries.is_none()
    }

    pub fn map(&self, event: &Event) -> Map<String, Value> {
        match &self.entries {
            Some(entries) => render_entries(entries, event),
            None => event.fields().clone(),
        }
    }
}
