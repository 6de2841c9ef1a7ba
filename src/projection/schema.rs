//! Entity schemas for projected data.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::envelope::EventType;

fn default_key_fields() -> Vec<String> {
    vec!["id".to_string()]
}

fn default_upsert_events() -> Vec<EventType> {
    vec![EventType::Created, EventType::Updated]
}

fn default_delete_events() -> Vec<EventType> {
    vec![EventType::Deleted]
}

/// Foreign key from one projected entity to another.
///
/// When `payload[field]` is set, a row of `entity` keyed by that value must
/// exist locally; if it does not, a stub `{key_field: value}` is created.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Reference {
    pub field: String,
    pub entity: String,
    #[serde(default = "default_key_field")]
    pub key_field: String,
}

fn default_key_field() -> String {
    "id".to_string()
}

impl Reference {
    pub fn new(field: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            entity: entity.into(),
            key_field: default_key_field(),
        }
    }
}

/// How events for one entity map onto projection rows.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EntitySchema {
    pub name: String,
    #[serde(default = "default_key_fields")]
    pub key_fields: Vec<String>,
    #[serde(default)]
    pub references: Vec<Reference>,
    #[serde(default = "default_upsert_events")]
    pub upsert_events: Vec<EventType>,
    #[serde(default = "default_delete_events")]
    pub delete_events: Vec<EventType>,
}

impl EntitySchema {
    /// Schema keyed by `id`, upserted on `CREATED`/`UPDATED`, deleted on
    /// `DELETED`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_fields: default_key_fields(),
            references: Vec::new(),
            upsert_events: default_upsert_events(),
            delete_events: default_delete_events(),
        }
    }

    pub fn with_key_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_reference(mut self, reference: Reference) -> Self {
        self.references.push(reference);
        self
    }

    pub fn with_upsert_event(mut self, event_type: impl Into<EventType>) -> Self {
        self.upsert_events.push(event_type.into());
        self
    }

    pub fn upserts(&self, event_type: &EventType) -> bool {
        self.upsert_events.contains(event_type)
    }

    pub fn deletes(&self, event_type: &EventType) -> bool {
        self.delete_events.contains(event_type)
    }

    /// Every event type this schema acts on.
    pub fn event_types(&self) -> impl Iterator<Item = &EventType> {
        self.upsert_events.iter().chain(self.delete_events.iter())
    }
}

/// Schemas of every entity a service projects.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    schemas: BTreeMap<String, EntitySchema>,
}

impl Catalog {
    /// Later schemas replace earlier ones with the same name.
    pub fn new(schemas: impl IntoIterator<Item = EntitySchema>) -> Self {
        Self {
            schemas: schemas
                .into_iter()
                .map(|schema| (schema.name.clone(), schema))
                .collect(),
        }
    }

    pub fn get(&self, entity: &str) -> Option<&EntitySchema> {
        self.schemas.get(entity)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntitySchema> {
        self.schemas.values()
    }

    pub fn entities(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Users, courses, grades, requests and replies.
    ///
    /// Grades are keyed by the student/course/submission triple since no
    /// single id is shared between the services that hold them.
    pub fn campus() -> Self {
        Self::new([
            EntitySchema::new("user"),
            EntitySchema::new("course"),
            EntitySchema::new("grade")
                .with_key_fields(["student_id", "course_id", "submission_id"])
                .with_reference(Reference::new("student_id", "user"))
                .with_reference(Reference::new("course_id", "course"))
                .with_upsert_event(EventType::Finalized),
            EntitySchema::new("request")
                .with_reference(Reference::new("student_id", "user"))
                .with_reference(Reference::new("course_id", "course")),
            EntitySchema::new("reply").with_reference(Reference::new("request_id", "request")),
        ])
    }
}
