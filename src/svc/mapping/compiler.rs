//! # Compiler module
//!
//! This module compiles a [`ResourceConfig`] into ready-to-evaluate
//! expressions and maps raw records to entities. Mapping failures are
//! per-record, they are collected and never abort a batch.

use std::{collections::BTreeMap, sync::Arc};

use serde_json::{json, Map, Value};

use crate::svc::{
    catalog::entity::{Entity, Relation},
    cfg::Configuration,
    expr::{self, truthy, Engine, Expression},
    mapping::{Error, PortAppConfig, ResourceConfig},
};

// -----------------------------------------------------------------------------
// MappingError enumeration

/// a per-record failure produced while mapping raw records to entities
#[derive(thiserror::Error, Clone, Debug)]
pub enum MappingError {
    #[error("failed to evaluate expression '{name}' for record {position}, {source}")]
    Expression {
        name: String,
        position: usize,
        source: expr::Error,
    },
    #[error("expression '{name}' for record {position} expected {expected}, got {got}")]
    Type {
        name: String,
        position: usize,
        expected: &'static str,
        got: String,
    },
    #[error("itemsToParse for record {position} expected an array, got {got}")]
    Items { position: usize, got: String },
    #[error("relation '{name}' for record {position} expected an identifier or a list of identifiers")]
    Relation { name: String, position: usize },
}

// -----------------------------------------------------------------------------
// MappingOutput structure

/// entities and failures produced by one batch
#[derive(Default, Debug)]
pub struct MappingOutput {
    pub entities: Vec<Entity>,
    pub errors: Vec<MappingError>,
}

// -----------------------------------------------------------------------------
// CompiledResource structure

/// a resource configuration with every expression compiled once, shared by
/// all mapping workers of a resync
#[derive(Clone)]
pub struct CompiledResource {
    pub kind: String,
    pub create_missing_related_entities: bool,
    pub delete_dependent_entities: bool,
    selector: Arc<dyn Expression>,
    items_to_parse: Option<Arc<dyn Expression>>,
    identifier: Arc<dyn Expression>,
    title: Option<Arc<dyn Expression>>,
    blueprint: Arc<dyn Expression>,
    properties: Vec<(String, Arc<dyn Expression>)>,
    relations: Vec<(String, Arc<dyn Expression>)>,
    static_blueprint: Option<String>,
}

impl CompiledResource {
    /// returns the blueprint identifier when the mapping declares it as a
    /// constant, letting the delete phase enumerate a kind that produced no
    /// entity
    pub fn blueprint_hint(&self) -> Option<&str> {
        self.static_blueprint.as_deref()
    }

    pub fn map_batch(&self, records: &[Value]) -> MappingOutput {
        let mut output = MappingOutput::default();

        for (position, record) in records.iter().enumerate() {
            self.map_record(record, position, &mut output);
        }

        output
    }

    fn map_record(&self, record: &Value, position: usize, output: &mut MappingOutput) {
        let selected = match self.selector.evaluate(record) {
            Ok(value) => truthy(&value),
            Err(err) => {
                output.errors.push(MappingError::Expression {
                    name: "selector.query".to_string(),
                    position,
                    source: err,
                });
                return;
            }
        };

        if !selected {
            return;
        }

        let units = match &self.items_to_parse {
            None => vec![record.to_owned()],
            Some(expression) => match expression.evaluate(record) {
                Ok(Value::Array(items)) => items
                    .into_iter()
                    .map(|item| expand(record, item))
                    .collect(),
                Ok(value) => {
                    output.errors.push(MappingError::Items {
                        position,
                        got: type_name(&value).to_string(),
                    });
                    return;
                }
                Err(err) => {
                    output.errors.push(MappingError::Expression {
                        name: "itemsToParse".to_string(),
                        position,
                        source: err,
                    });
                    return;
                }
            },
        };

        for unit in &units {
            match self.build_entity(unit, position) {
                Ok(entity) => output.entities.push(entity),
                Err(err) => output.errors.push(err),
            }
        }
    }

    fn build_entity(&self, input: &Value, position: usize) -> Result<Entity, MappingError> {
        let identifier = self.string_field(&self.identifier, "identifier", input, position)?;
        let blueprint = self.string_field(&self.blueprint, "blueprint", input, position)?;

        let title = match &self.title {
            None => None,
            Some(expression) => {
                match evaluate(expression, "title", input, position)? {
                    Value::Null => None,
                    Value::String(title) => Some(title),
                    value => {
                        return Err(MappingError::Type {
                            name: "title".to_string(),
                            position,
                            expected: "a string or null",
                            got: type_name(&value).to_string(),
                        })
                    }
                }
            }
        };

        let mut properties = BTreeMap::new();
        for (name, expression) in &self.properties {
            let value = evaluate(expression, &format!("properties.{name}"), input, position)?;
            // a null property maps to absent
            if !value.is_null() {
                properties.insert(name.to_owned(), value);
            }
        }

        let mut relations = BTreeMap::new();
        for (name, expression) in &self.relations {
            match evaluate(expression, &format!("relations.{name}"), input, position)? {
                Value::Null => {}
                Value::String(target) => {
                    relations.insert(name.to_owned(), Relation::Single(target));
                }
                Value::Array(items) => {
                    let targets = items
                        .into_iter()
                        .map(|item| match item {
                            Value::String(target) => Some(target),
                            _ => None,
                        })
                        .collect::<Option<Vec<String>>>()
                        .ok_or_else(|| MappingError::Relation {
                            name: name.to_owned(),
                            position,
                        })?;

                    relations.insert(name.to_owned(), Relation::Many(targets));
                }
                _ => {
                    return Err(MappingError::Relation {
                        name: name.to_owned(),
                        position,
                    })
                }
            }
        }

        Ok(Entity {
            identifier,
            blueprint,
            title,
            properties,
            relations,
        })
    }

    fn string_field(
        &self,
        expression: &Arc<dyn Expression>,
        name: &str,
        input: &Value,
        position: usize,
    ) -> Result<String, MappingError> {
        match evaluate(expression, name, input, position)? {
            Value::String(value) if !value.is_empty() => Ok(value),
            value => Err(MappingError::Type {
                name: name.to_string(),
                position,
                expected: "a non-empty string",
                got: type_name(&value).to_string(),
            }),
        }
    }
}

// -----------------------------------------------------------------------------
// Compilation helpers

/// compiles every resource of the mapping document, resolving per-kind flags
/// against the document and integration defaults
pub fn compile(
    engine: &dyn Engine,
    config: &Configuration,
    app_config: &PortAppConfig,
) -> Result<Vec<CompiledResource>, Error> {
    let mut kinds = std::collections::HashSet::new();

    for resource in &app_config.resources {
        if !kinds.insert(resource.kind.as_str()) {
            return Err(Error::DuplicateKind(resource.kind.to_owned()));
        }
    }

    app_config
        .resources
        .iter()
        .map(|resource| compile_resource(engine, config, app_config, resource))
        .collect()
}

pub fn compile_resource(
    engine: &dyn Engine,
    config: &Configuration,
    app_config: &PortAppConfig,
    resource: &ResourceConfig,
) -> Result<CompiledResource, Error> {
    let mappings = &resource.port.entity.mappings;

    let selector = compile_expr(engine, &resource.kind, "selector.query", &resource.selector.query)?;
    let items_to_parse = resource
        .port
        .items_to_parse
        .as_ref()
        .map(|source| compile_expr(engine, &resource.kind, "itemsToParse", source))
        .transpose()?;
    let identifier = compile_expr(engine, &resource.kind, "identifier", &mappings.identifier)?;
    let title = mappings
        .title
        .as_ref()
        .map(|source| compile_expr(engine, &resource.kind, "title", source))
        .transpose()?;
    let blueprint = compile_expr(engine, &resource.kind, "blueprint", &mappings.blueprint)?;

    let properties = mappings
        .properties
        .iter()
        .map(|(name, source)| {
            compile_expr(engine, &resource.kind, &format!("properties.{name}"), source)
                .map(|expression| (name.to_owned(), expression))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let relations = mappings
        .relations
        .iter()
        .map(|(name, source)| {
            compile_expr(engine, &resource.kind, &format!("relations.{name}"), source)
                .map(|expression| (name.to_owned(), expression))
        })
        .collect::<Result<Vec<_>, _>>()?;

    // a constant blueprint expression evaluates against an empty record
    let static_blueprint = blueprint
        .evaluate(&Value::Object(Map::new()))
        .ok()
        .and_then(|value| match value {
            Value::String(blueprint) if !blueprint.is_empty() => Some(blueprint),
            _ => None,
        });

    Ok(CompiledResource {
        kind: resource.kind.to_owned(),
        create_missing_related_entities: resource
            .create_missing_related_entities
            .or(app_config.create_missing_related_entities)
            .unwrap_or(config.create_missing_related_entities),
        delete_dependent_entities: resource
            .delete_dependent_entities
            .or(app_config.delete_dependent_entities)
            .unwrap_or(config.delete_dependent_entities),
        selector,
        items_to_parse,
        identifier,
        title,
        blueprint,
        properties,
        relations,
        static_blueprint,
    })
}

fn compile_expr(
    engine: &dyn Engine,
    kind: &str,
    name: &str,
    source: &str,
) -> Result<Arc<dyn Expression>, Error> {
    engine.compile(source).map_err(|err| Error::Compile {
        kind: kind.to_string(),
        name: name.to_string(),
        source: err,
    })
}

// -----------------------------------------------------------------------------
// helpers

fn evaluate(
    expression: &Arc<dyn Expression>,
    name: &str,
    input: &Value,
    position: usize,
) -> Result<Value, MappingError> {
    expression
        .evaluate(input)
        .map_err(|err| MappingError::Expression {
            name: name.to_string(),
            position,
            source: err,
        })
}

/// the ambient `.item` is injected next to the record's own fields
fn expand(record: &Value, item: Value) -> Value {
    match record {
        Value::Object(map) => {
            let mut map = map.to_owned();
            map.insert("item".to_string(), item);

            Value::Object(map)
        }
        _ => json!({ "item": item }),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{compile, CompiledResource, MappingError};
    use crate::svc::{
        catalog::entity::Relation,
        cfg::tests_support::configuration,
        expr::filter::FilterEngine,
        mapping::PortAppConfig,
    };

    fn compiled(document: &str) -> Vec<CompiledResource> {
        let app_config: PortAppConfig =
            serde_yaml::from_str(document).expect("mapping document to parse");

        compile(&FilterEngine, &configuration(), &app_config).expect("mapping to compile")
    }

    fn issue_resource() -> CompiledResource {
        compiled(
            r#"
resources:
  - kind: issue
    selector:
      query: '.discarded | not'
    port:
      entity:
        mappings:
          identifier: .id
          title: .summary
          blueprint: '"jiraIssue"'
          properties:
            status: .status
          relations:
            project: .project
            subtasks: .subtasks
"#,
        )
        .remove(0)
    }

    #[test]
    fn matching_records_should_produce_entities() {
        let resource = issue_resource();
        let output = resource.map_batch(&[
            json!({"id": "A", "summary": "a", "status": "open", "project": "PROJ"}),
            json!({"id": "B", "summary": "b", "subtasks": ["C", "D"]}),
        ]);

        assert!(output.errors.is_empty());
        assert_eq!(output.entities.len(), 2);

        let first = &output.entities[0];
        assert_eq!(first.identifier, "A");
        assert_eq!(first.blueprint, "jiraIssue");
        assert_eq!(first.title.as_deref(), Some("a"));
        assert_eq!(first.properties["status"], json!("open"));
        assert_eq!(
            first.relations["project"],
            Relation::Single("PROJ".to_string())
        );

        let second = &output.entities[1];
        // null property and null relation map to absent
        assert!(second.properties.is_empty());
        assert_eq!(
            second.relations["subtasks"],
            Relation::Many(vec!["C".to_string(), "D".to_string()])
        );
    }

    #[test]
    fn selector_should_discard_records() {
        let resource = issue_resource();
        let output = resource.map_batch(&[
            json!({"id": "A", "summary": "a"}),
            json!({"id": "B", "summary": "b", "discarded": true}),
        ]);

        assert!(output.errors.is_empty());
        assert_eq!(output.entities.len(), 1);
        assert_eq!(output.entities[0].identifier, "A");
    }

    #[test]
    fn empty_identifier_should_fail_the_entity_only() {
        let resource = issue_resource();
        let output = resource.map_batch(&[
            json!({"id": "", "summary": "empty"}),
            json!({"summary": "missing"}),
            json!({"id": "A", "summary": "a"}),
        ]);

        assert_eq!(output.entities.len(), 1);
        assert_eq!(output.entities[0].identifier, "A");
        assert_eq!(output.errors.len(), 2);
        assert!(matches!(output.errors[0], MappingError::Type { .. }));
    }

    #[test]
    fn invalid_relation_should_fail_the_entity() {
        let resource = issue_resource();
        let output = resource.map_batch(&[json!({"id": "A", "summary": "a", "project": 42})]);

        assert!(output.entities.is_empty());
        assert!(matches!(output.errors[0], MappingError::Relation { .. }));
    }

    #[test]
    fn items_to_parse_should_expand_records() {
        let resources = compiled(
            r#"
resources:
  - kind: deployment
    port:
      itemsToParse: .containers
      entity:
        mappings:
          identifier: .item.name
          blueprint: '"container"'
          properties:
            image: .item.image
            deployment: .name
"#,
        );

        let output = resources[0].map_batch(&[json!({
            "name": "api",
            "containers": [
                {"name": "api-main", "image": "api:1"},
                {"name": "api-sidecar", "image": "envoy:2"},
            ],
        })]);

        assert!(output.errors.is_empty());
        assert_eq!(output.entities.len(), 2);
        assert_eq!(output.entities[0].identifier, "api-main");
        assert_eq!(output.entities[0].properties["deployment"], json!("api"));
        assert_eq!(output.entities[1].properties["image"], json!("envoy:2"));
    }

    #[test]
    fn items_to_parse_rejects_non_arrays() {
        let resources = compiled(
            r#"
resources:
  - kind: deployment
    port:
      itemsToParse: .containers
      entity:
        mappings:
          identifier: .item.name
          blueprint: '"container"'
"#,
        );

        // null and scalar results are both mapping failures, an empty array
        // simply produces nothing
        let output = resources[0].map_batch(&[
            json!({"name": "api"}),
            json!({"name": "web", "containers": "oops"}),
            json!({"name": "empty", "containers": []}),
        ]);

        assert!(output.entities.is_empty());
        assert_eq!(output.errors.len(), 2);
        assert!(matches!(output.errors[0], MappingError::Items { .. }));
    }

    #[test]
    fn duplicate_kinds_should_fail_compilation() {
        let app_config: PortAppConfig = serde_yaml::from_str(
            r#"
resources:
  - kind: issue
    port:
      entity:
        mappings:
          identifier: .id
          blueprint: '"jiraIssue"'
  - kind: issue
    port:
      entity:
        mappings:
          identifier: .id
          blueprint: '"jiraIssue"'
"#,
        )
        .expect("mapping document to parse");

        assert!(compile(&FilterEngine, &configuration(), &app_config).is_err());
    }

    #[test]
    fn invalid_expression_should_fail_compilation() {
        let app_config: PortAppConfig = serde_yaml::from_str(
            r#"
resources:
  - kind: issue
    port:
      entity:
        mappings:
          identifier: '.id |'
          blueprint: '"jiraIssue"'
"#,
        )
        .expect("mapping document to parse");

        assert!(compile(&FilterEngine, &configuration(), &app_config).is_err());
    }

    #[test]
    fn blueprint_hint_should_detect_constants() {
        let resource = issue_resource();
        assert_eq!(resource.blueprint_hint(), Some("jiraIssue"));

        let dynamic = compiled(
            r#"
resources:
  - kind: issue
    port:
      entity:
        mappings:
          identifier: .id
          blueprint: .blueprint
"#,
        )
        .remove(0);

        assert_eq!(dynamic.blueprint_hint(), None);
    }

    #[test]
    fn flags_should_resolve_resource_over_document_over_defaults() {
        let resources = compiled(
            r#"
createMissingRelatedEntities: false
resources:
  - kind: issue
    createMissingRelatedEntities: true
    port:
      entity:
        mappings:
          identifier: .id
          blueprint: '"jiraIssue"'
  - kind: project
    port:
      entity:
        mappings:
          identifier: .key
          blueprint: '"jiraProject"'
"#,
        );

        // resource override wins over the document default
        assert!(resources[0].create_missing_related_entities);
        // document default wins over the integration default (true)
        assert!(!resources[1].create_missing_related_entities);
        // nothing set, integration default applies
        assert!(resources[1].delete_dependent_entities);
    }
}
