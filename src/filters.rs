use crate::error::CatalogError;
use crate::types::Filter;
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

const BUILTIN_CATALOG: &str = include_str!("filters.json");

/// Category name used for queries given directly on the command line.
pub const CUSTOM_CATEGORY: &str = "custom";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub name: String,
    pub filters: Vec<Filter>,
}

/// Immutable taxonomy of search queries, grouped by category in declared order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterCatalog {
    categories: Vec<Category>,
}

impl FilterCatalog {
    /// Parse catalog JSON of the form `{"category": ["query", ...], ...}`.
    ///
    /// Category and query order are preserved. Duplicate queries are kept.
    pub fn parse_str(s: &str) -> Result<Self, CatalogError> {
        let root: Value = serde_json::from_str(s)?;
        let Value::Object(map) = root else {
            return Err(CatalogError::MissingCategory(
                "top level must be an object of category -> queries".into(),
            ));
        };
        Self::from_map(map)
    }

    /// Load a catalog file. A missing file is an error, not an empty catalog.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_str(&content)
    }

    /// The taxonomy shipped with the binary.
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::parse_str(BUILTIN_CATALOG)
    }

    /// Load from `path` when given, else the built-in taxonomy.
    pub fn load(path: Option<&Path>) -> Result<Self, CatalogError> {
        match path {
            Some(p) => Self::load_from_path(p),
            None => Self::builtin(),
        }
    }

    fn from_map(map: Map<String, Value>) -> Result<Self, CatalogError> {
        let mut categories = Vec::with_capacity(map.len());
        for (name, value) in map {
            if name.trim().is_empty() {
                return Err(CatalogError::MissingCategory("empty category name".into()));
            }
            let Value::Array(items) = value else {
                return Err(CatalogError::MissingCategory(format!(
                    "category `{name}` must map to an array of query strings"
                )));
            };
            let mut filters = Vec::with_capacity(items.len());
            for (position, item) in items.into_iter().enumerate() {
                let query = match item {
                    Value::String(q) if !q.trim().is_empty() => q,
                    Value::String(_) => {
                        return Err(CatalogError::EmptyQuery {
                            category: name.clone(),
                            position,
                        })
                    }
                    _ => {
                        return Err(CatalogError::MissingCategory(format!(
                            "category `{name}` entry {position} is not a string"
                        )))
                    }
                };
                filters.push(Filter::new(name.clone(), query));
            }
            categories.push(Category { name, filters });
        }
        Ok(Self { categories })
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    /// Every filter across all categories.
    pub fn all(&self) -> Vec<Filter> {
        self.categories
            .iter()
            .flat_map(|c| c.filters.iter().cloned())
            .collect()
    }

    pub fn filter_by_category(&self, name: &str) -> Result<Vec<Filter>, CatalogError> {
        self.categories
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.filters.clone())
            .ok_or_else(|| CatalogError::UnknownCategory(name.to_string()))
    }

    /// Pick filters for a run: explicit queries win over a category, which wins over everything.
    pub fn select(
        &self,
        category: Option<&str>,
        queries: &[String],
    ) -> Result<Vec<Filter>, CatalogError> {
        if !queries.is_empty() {
            return custom(queries);
        }
        match category {
            Some(name) => self.filter_by_category(name),
            None => Ok(self.all()),
        }
    }

    pub fn len(&self) -> usize {
        self.categories.iter().map(|c| c.filters.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build ad-hoc filters from raw query strings.
pub fn custom(queries: &[String]) -> Result<Vec<Filter>, CatalogError> {
    queries
        .iter()
        .enumerate()
        .map(|(position, q)| {
            if q.trim().is_empty() {
                Err(CatalogError::EmptyQuery {
                    category: CUSTOM_CATEGORY.to_string(),
                    position,
                })
            } else {
                Ok(Filter::new(CUSTOM_CATEGORY, q.clone()))
            }
        })
        .collect()
}
