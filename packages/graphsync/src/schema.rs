//! Model schema: columns, associations, aggregates and scopes
//!
//! The same declaration drives the ephemeral store (server side) and the
//! mirror graph (client side), so both ends agree on foreign keys, inverse
//! associations and inheritance columns.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::scalar::{ColumnType, Scalar};

fn default_primary_key() -> String {
    "id".to_string()
}

fn default_inheritance_column() -> String {
    "type".to_string()
}

/// All models known to one application
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    pub models: IndexMap<String, ModelSchema>,
}

/// Declaration of one model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSchema {
    /// Parent model for single-table inheritance
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    #[serde(default = "default_inheritance_column")]
    pub inheritance_column: String,
    #[serde(default)]
    pub columns: IndexMap<String, ColumnType>,
    #[serde(default)]
    pub associations: IndexMap<String, AssociationSchema>,
    #[serde(default)]
    pub aggregates: IndexMap<String, AggregateReflection>,
    #[serde(default)]
    pub scopes: IndexMap<String, ScopeSchema>,
}

impl Default for ModelSchema {
    fn default() -> Self {
        ModelSchema {
            base: None,
            primary_key: default_primary_key(),
            inheritance_column: default_inheritance_column(),
            columns: IndexMap::new(),
            associations: IndexMap::new(),
            aggregates: IndexMap::new(),
            scopes: IndexMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationKind {
    BelongsTo,
    HasOne,
    HasMany,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationSchema {
    pub kind: AssociationKind,
    pub model: String,
    #[serde(default)]
    pub foreign_key: Option<String>,
    /// Name of the opposite association on `model`
    #[serde(default)]
    pub inverse_of: Option<String>,
}

/// Composed attribute made of several columns
///
/// `mapping` pairs a stored column with the accessor of the value object:
/// `[["address_street", "street"], ["address_zip", "zip"]]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateReflection {
    pub mapping: Vec<(String, String)>,
    /// Aggregates that are themselves entities are navigated like associations
    #[serde(default)]
    pub entity: bool,
}

/// Named filter over a model's records
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeSchema {
    #[serde(default, rename = "where")]
    pub conditions: IndexMap<String, Scalar>,
    /// Columns matched positionally against call arguments
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub order: Option<String>,
}

impl Schema {
    /// Check that every referenced model exists
    pub fn validate(&self) -> Result<()> {
        for (name, model) in &self.models {
            if let Some(base) = &model.base {
                if !self.models.contains_key(base) {
                    return Err(SyncError::Config(format!(
                        "model {} inherits from unknown model {}",
                        name, base
                    )));
                }
            }
            for (assoc_name, assoc) in &model.associations {
                if !self.models.contains_key(&assoc.model) {
                    return Err(SyncError::Config(format!(
                        "association {}.{} targets unknown model {}",
                        name, assoc_name, assoc.model
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn model(&self, name: &str) -> Option<&ModelSchema> {
        self.models.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Model followed by its ancestors, most specific first
    fn lineage<'a>(&'a self, name: &str) -> impl Iterator<Item = (&'a str, &'a ModelSchema)> + 'a {
        let mut next = self.models.get_key_value(name).map(|(key, _)| key.as_str());
        std::iter::from_fn(move || {
            let current = next?;
            let model = self.models.get(current)?;
            next = model.base.as_deref();
            Some((current, model))
        })
    }

    /// Root of the inheritance chain; records are indexed under it
    pub fn base_model<'a>(&'a self, name: &'a str) -> &'a str {
        self.lineage(name).last().map(|(n, _)| n).unwrap_or(name)
    }

    /// True when `name` is `ancestor` or inherits from it
    pub fn is_a(&self, name: &str, ancestor: &str) -> bool {
        self.lineage(name).any(|(n, _)| n == ancestor)
    }

    pub fn inheritance_column(&self, name: &str) -> &str {
        self.model(self.base_model(name))
            .map(|m| m.inheritance_column.as_str())
            .unwrap_or("type")
    }

    pub fn primary_key(&self, name: &str) -> &str {
        self.model(self.base_model(name))
            .map(|m| m.primary_key.as_str())
            .unwrap_or("id")
    }

    pub fn column_type(&self, model: &str, column: &str) -> Option<ColumnType> {
        self.lineage(model).find_map(|(_, m)| m.columns.get(column).copied())
    }

    pub fn association(&self, model: &str, name: &str) -> Option<&AssociationSchema> {
        self.lineage(model).find_map(|(_, m)| m.associations.get(name))
    }

    pub fn aggregate(&self, model: &str, name: &str) -> Option<&AggregateReflection> {
        self.lineage(model).find_map(|(_, m)| m.aggregates.get(name))
    }

    pub fn scope(&self, model: &str, name: &str) -> Option<&ScopeSchema> {
        self.lineage(model).find_map(|(_, m)| m.scopes.get(name))
    }

    /// Column holding the foreign key for an association of `model`
    ///
    /// `belongs_to :owner` lives on the record as `owner_id`; `has_many` and
    /// `has_one` point at the inverse `belongs_to` on the target model.
    pub fn foreign_key(&self, model: &str, name: &str) -> Option<String> {
        let assoc = self.association(model, name)?;
        if let Some(fk) = &assoc.foreign_key {
            return Some(fk.clone());
        }
        match assoc.kind {
            AssociationKind::BelongsTo => Some(format!("{}_id", name)),
            AssociationKind::HasOne | AssociationKind::HasMany => match &assoc.inverse_of {
                Some(inverse) => self
                    .association(&assoc.model, inverse)
                    .and_then(|inv| inv.foreign_key.clone())
                    .or_else(|| Some(format!("{}_id", inverse))),
                None => Some(format!("{}_id", self.base_model(model).to_lowercase())),
            },
        }
    }
}

#[cfg(test)]
mod schema_tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Schema {
        serde_json::from_value(json!({
            "models": {
                "User": {
                    "columns": {"email": "string"},
                    "associations": {
                        "todos": {"kind": "has_many", "model": "Todo", "inverse_of": "owner"}
                    }
                },
                "Admin": {"base": "User", "columns": {"level": "integer"}},
                "Todo": {
                    "columns": {"title": "string", "due": "date"},
                    "associations": {
                        "owner": {"kind": "belongs_to", "model": "User"}
                    }
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_inheritance_lookup() {
        let schema = sample();
        assert_eq!(schema.base_model("Admin"), "User");
        assert!(schema.is_a("Admin", "User"));
        assert!(!schema.is_a("User", "Admin"));
        assert_eq!(schema.column_type("Admin", "email"), Some(ColumnType::String));
        assert_eq!(schema.column_type("Admin", "level"), Some(ColumnType::Integer));
        assert!(schema.association("Admin", "todos").is_some());
    }

    #[test]
    fn test_lookups_outlive_the_queried_names() {
        let schema = sample();
        let (assoc, column) = {
            let model = String::from("Admin");
            let name = String::from("todos");
            (schema.association(&model, &name), schema.column_type(&model, "level"))
        };
        assert_eq!(assoc.map(|a| a.model.as_str()), Some("Todo"));
        assert_eq!(column, Some(ColumnType::Integer));
        assert_eq!(schema.base_model("Ghost"), "Ghost");
    }

    #[test]
    fn test_foreign_keys() {
        let schema = sample();
        assert_eq!(schema.foreign_key("Todo", "owner").as_deref(), Some("owner_id"));
        assert_eq!(schema.foreign_key("User", "todos").as_deref(), Some("owner_id"));
        assert_eq!(schema.foreign_key("User", "missing"), None);
    }

    #[test]
    fn test_validate_rejects_unknown_targets() {
        let schema: Schema = serde_json::from_value(json!({
            "models": {
                "Todo": {"associations": {"owner": {"kind": "belongs_to", "model": "Ghost"}}}
            }
        }))
        .unwrap();
        assert!(matches!(schema.validate(), Err(SyncError::Config(_))));
    }
}
